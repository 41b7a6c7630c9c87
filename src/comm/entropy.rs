use rand::{Rng, RngCore};


/// Where the mesh draws its non-cryptographic randomness: ids for frames
///  entering through a local gate, keepalive nonces, random-early-drop
///  decisions, and uniform peer picks.
///
/// Static methods keep the seam zero-sized on the structs it parameterizes;
///  tests substitute the mock to pin individual draws.
#[cfg_attr(test, mockall::automock)]
pub trait MeshEntropy {
    /// id stamped on a frame entering the mesh through a local gate
    fn packet_id() -> u32;

    /// nonce carried by a keepalive ping
    fn ping_nonce() -> u8;

    /// uniform draw in `[0, 1)` deciding a random early drop
    fn drop_draw() -> f64;

    /// uniform index below `n`; `n` must be positive
    fn pick(n: usize) -> usize;
}

/// Production draws come from the thread-local generator. Packet ids
///  tolerate collisions (the ID cache merely forwards a duplicate id once),
///  so nothing here needs to be cryptographically strong.
pub struct ThreadRngEntropy;

impl MeshEntropy for ThreadRngEntropy {
    fn packet_id() -> u32 {
        rand::thread_rng().next_u32()
    }

    fn ping_nonce() -> u8 {
        rand::thread_rng().gen()
    }

    fn drop_draw() -> f64 {
        rand::thread_rng().gen()
    }

    fn pick(n: usize) -> usize {
        rand::thread_rng().gen_range(0..n)
    }
}

/// Uniformly picks one element, `None` when there is nothing to pick from.
pub fn pick_one<E: MeshEntropy, T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    Some(&items[E::pick(items.len())])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::ENTROPY_LOCK;

    #[test]
    fn test_pick_one_empty() {
        let items: Vec<u32> = vec![];
        assert_eq!(pick_one::<ThreadRngEntropy, _>(&items), None);
    }

    #[test]
    fn test_pick_one_uses_the_draw() {
        let _guard = ENTROPY_LOCK.lock().unwrap();
        let ctx = MockMeshEntropy::pick_context();
        ctx.expect().returning(|n| n - 1);

        let items = vec![7u32, 8, 9];
        assert_eq!(pick_one::<MockMeshEntropy, _>(&items), Some(&9));
    }

    #[test]
    fn test_thread_rng_pick_stays_in_range() {
        for _ in 0..100 {
            assert!(ThreadRngEntropy::pick(3) < 3);
        }
        let p = ThreadRngEntropy::drop_draw();
        assert!((0.0..1.0).contains(&p));
    }
}
