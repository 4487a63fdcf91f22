//! Shards fragments across the worker pool by aircraft id.
//!
//! The one consistency contract in the pipeline: the storage sink's
//! write-and-merge is not safe under concurrent writers for the same
//! aircraft, so every fragment for a given id must land on the same
//! worker queue. The shard is a stable function of the id alone.

use tokio::sync::mpsc;
use tracing::info;

use crate::message::IcaoId;
use crate::track_buffer::Fragment;

/// FNV-1a, 32 bit. Inlined rather than pulled from a crate so the shard
/// function can never drift out from under persisted per-worker state.
fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Stable worker assignment for an aircraft id.
pub fn worker_for(icao: &IcaoId, workers: usize) -> usize {
    (fnv1a32(icao.as_str().as_bytes()) as usize) % workers
}

/// Forwards each fragment to its aircraft's worker queue. Exits when the
/// inbound queue closes or when any worker queue has gone away.
pub async fn run_dispatcher(
    mut inbound: mpsc::Receiver<Fragment>,
    workers: Vec<mpsc::Sender<Fragment>>,
) {
    while let Some(fragment) = inbound.recv().await {
        let id = worker_for(&fragment.icao, workers.len());
        if workers[id].send(fragment).await.is_err() {
            break;
        }
    }
    info!("dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_reference_vectors() {
        // Published FNV-1a test vectors.
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn shard_matches_the_hash() {
        for n in [1, 4, 16, 256] {
            for icao in ["AAAAAA", "BBBBBB", "A1B2C3"] {
                let id = IcaoId::new(icao);
                assert_eq!(
                    worker_for(&id, n),
                    (fnv1a32(icao.as_bytes()) as usize) % n
                );
            }
        }
    }

    #[test]
    fn shard_is_stable_across_calls() {
        let id = IcaoId::new("AAAAAA");
        let first = worker_for(&id, 4);
        for _ in 0..100 {
            assert_eq!(worker_for(&id, 4), first);
        }
    }

    #[test]
    fn shard_is_always_in_range() {
        for i in 0..500u32 {
            let id = IcaoId::new(format!("{i:06X}"));
            assert!(worker_for(&id, 16) < 16);
        }
    }
}
