//! Instance placement across nodes.
//!
//! Randomized round-robin: starting at a random node, walk the list and
//! bind (or kill) one instance per eligible node until the delta is
//! satisfied or the attempt budget runs out. The remainder is returned and
//! deliberately not retried within the same scheduling round.

use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::node::Node;

/// Place (`num > 0`) or destroy (`num < 0`) instances of `func` across
/// `nodes`. Returns the non-negative unscheduled remainder.
pub fn schedule(nodes: &mut [Node], rng: &mut StdRng, now: u64, func: &str, num: i64) -> i64 {
    assert!(num != 0, "scheduling a zero delta");
    let total_nodes = nodes.len();
    if total_nodes == 0 {
        return num.abs();
    }

    let mut i = rng.gen_range(0..total_nodes);
    let worst_case = num.unsigned_abs() as usize * total_nodes;
    let mut attempts = 0;

    if num > 0 {
        // Bind new instances to nodes.
        let mut num = num;
        while attempts < worst_case {
            let node = &mut nodes[i % total_nodes];
            if node.get_num_available_slots() > 0 {
                node.bind(now, func, 1);
                num -= 1;
            }
            if num == 0 {
                break;
            }
            attempts += 1;
            i += 1;
        }
        if num > 0 {
            debug!(clock = now, func = %func, unscheduled = num, "instances left unscheduled");
        }
        num
    } else {
        // Destroy instances.
        let mut quantity = -num;
        while attempts < worst_case {
            let node = &mut nodes[i % total_nodes];
            if node.kill(now, func, 1) == 0 {
                quantity -= 1;
            }
            if quantity == 0 {
                break;
            }
            attempts += 1;
            i += 1;
        }
        quantity
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
