use shardcache_common::Result;

/// The host application's half of the protocol: how commands leave this
/// replica, how a committed mutation gets applied, and how a stalled
/// peer gets nudged to recover.
pub trait EngineCallbacks: Send + Sync {
    /// Send an encoded message to each of `recipients`.
    fn send(&self, recipients: &[String], message: &[u8]) -> Result<()>;

    /// Apply a committed mutation. `leader` is true only on the replica
    /// that originated the command.
    fn commit(&self, ctype: u8, key: &[u8], data: &[u8], leader: bool) -> Result<()>;

    /// Ask `peer` to report what it knows about `key` so a stuck
    /// command can be recovered.
    fn recover(&self, peer: &str, key: &[u8], seq: u64, ballot: u64) -> Result<()>;
}
