//! Hardware topology snapshot.
//!
//! The thread pool assigns thread ids to cpus grouped by NUMA node, so that
//! the threads of one socket get contiguous tids and the lowest tid on each
//! socket acts as the socket *leader*. All queries here are answered from
//! tables computed once at first use.

use once_cell::sync::OnceCell;

/// Parse a sysfs cpu list ("0-3,8,10-11") into the ids it names, in list
/// order. Empty entries are tolerated (the kernel emits none, but an empty
/// file trims to one); anything unparsable yields `None` so callers can
/// fall back to the flat topology.
pub fn parse_cpu_list(list: &str) -> Option<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in list.split(',').filter(|e| !e.is_empty()) {
        let (first, last): (u32, u32) = match entry.split_once('-') {
            Some((first, last)) => (first.parse().ok()?, last.parse().ok()?),
            None => {
                let id = entry.parse().ok()?;
                (id, id)
            }
        };
        ids.extend(first..=last);
    }
    Some(ids)
}

/// A snapshot of the machine's cpu and NUMA layout, with the tid→cpu and
/// tid→socket assignment derived from it.
#[derive(Debug)]
pub struct Topology {
    /// One entry per tid: the cpu this tid is pinned to (when pinning is
    /// possible).
    cpu_for_tid: Vec<u32>,
    /// One entry per tid: the compacted socket index.
    socket_for_tid: Vec<usize>,
    /// One entry per tid: the lowest tid sharing this tid's socket.
    leader_for_tid: Vec<usize>,
    /// One entry per socket: the leader tid.
    leader_for_socket: Vec<usize>,
    /// One entry per tid: `max(socket_for_tid[0..=tid])`.
    cumulative_max_socket: Vec<usize>,
}

impl Topology {
    /// The maximum number of worker threads, i.e. the detected hardware
    /// concurrency.
    pub fn max_threads(&self) -> usize {
        self.cpu_for_tid.len()
    }

    /// The number of NUMA sockets covered by the tid assignment.
    pub fn max_sockets(&self) -> usize {
        self.leader_for_socket.len()
    }

    /// The socket that `tid` runs on.
    pub fn socket(&self, tid: usize) -> usize {
        self.socket_for_tid[tid]
    }

    /// True iff no lower-numbered tid shares `tid`'s socket.
    pub fn is_leader(&self, tid: usize) -> bool {
        self.leader_for_tid[tid] == tid
    }

    /// The leader tid of `tid`'s socket.
    pub fn leader(&self, tid: usize) -> usize {
        self.leader_for_tid[tid]
    }

    /// The leader tid of the given socket.
    pub fn leader_for_socket(&self, socket: usize) -> usize {
        self.leader_for_socket[socket]
    }

    /// The highest socket index in use by tids `0..=tid`. Used to size
    /// per-socket structures when only the first `n` threads are active.
    pub fn cumulative_max_socket(&self, tid: usize) -> usize {
        self.cumulative_max_socket[tid]
    }

    /// The cpu that `tid` should be pinned to.
    pub fn cpu(&self, tid: usize) -> u32 {
        self.cpu_for_tid[tid]
    }

    fn from_cpu_assignment(cpu_nodes: Vec<(u32, u32)>) -> Self {
        assert!(!cpu_nodes.is_empty());

        // compact the node ids (sysfs node numbering may have holes)
        let mut node_ids: Vec<u32> = cpu_nodes.iter().map(|x| x.1).collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        let cpu_for_tid: Vec<u32> = cpu_nodes.iter().map(|x| x.0).collect();
        let socket_for_tid: Vec<usize> = cpu_nodes
            .iter()
            .map(|x| node_ids.binary_search(&x.1).unwrap())
            .collect();

        let num_sockets = node_ids.len();
        let mut leader_for_socket = vec![usize::MAX; num_sockets];
        for (tid, &socket) in socket_for_tid.iter().enumerate() {
            if leader_for_socket[socket] == usize::MAX {
                leader_for_socket[socket] = tid;
            }
        }

        let leader_for_tid: Vec<usize> = socket_for_tid
            .iter()
            .map(|&s| leader_for_socket[s])
            .collect();

        let mut cumulative_max_socket = Vec::with_capacity(socket_for_tid.len());
        let mut max_so_far = 0;
        for &s in &socket_for_tid {
            max_so_far = max_so_far.max(s);
            cumulative_max_socket.push(max_so_far);
        }

        Self {
            cpu_for_tid,
            socket_for_tid,
            leader_for_tid,
            leader_for_socket,
            cumulative_max_socket,
        }
    }

    fn detect() -> Self {
        match Self::detect_from_sysfs() {
            Some(topo) => topo,
            None => {
                log::warn!("could not read NUMA topology from sysfs; assuming a single socket");
                Self::detect_flat()
            }
        }
    }

    /// Read nodes and their cpu lists from `/sys/devices/system/node`,
    /// restricted to the cpus this process may run on.
    fn detect_from_sysfs() -> Option<Topology> {
        let affinity = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).ok()?;

        let possible = std::fs::read_to_string("/sys/devices/system/node/possible").ok()?;
        let nodes = parse_cpu_list(possible.trim())?;

        // (cpu, node) pairs ordered by node so that socket members get
        // contiguous tids
        let mut cpu_nodes: Vec<(u32, u32)> = Vec::new();
        for node in nodes {
            let name = format!("/sys/devices/system/node/node{node}/cpulist");
            let Some(cpus) = std::fs::read_to_string(name)
                .ok()
                .and_then(|list| parse_cpu_list(list.trim()))
            else {
                continue;
            };
            for cpu in cpus {
                if affinity.is_set(cpu as usize).unwrap_or(false) {
                    cpu_nodes.push((cpu, node));
                }
            }
        }

        if cpu_nodes.is_empty() {
            return None;
        }

        Some(Self::from_cpu_assignment(cpu_nodes))
    }

    /// Fallback: one socket covering `available_parallelism` cpus.
    fn detect_flat() -> Topology {
        let n = std::thread::available_parallelism()
            .map(|x| x.get())
            .unwrap_or(1);
        Self::from_cpu_assignment((0..n as u32).map(|cpu| (cpu, 0)).collect())
    }
}

static TOPOLOGY: OnceCell<Topology> = OnceCell::new();

/// The process-wide topology snapshot, detected on first use.
pub fn topology() -> &'static Topology {
    TOPOLOGY.get_or_init(Topology::detect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list(""), Some(vec![]));
        assert_eq!(parse_cpu_list("4"), Some(vec![4]));
        assert_eq!(parse_cpu_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(
            parse_cpu_list("0-2,8,10-11"),
            Some(vec![0, 1, 2, 8, 10, 11])
        );
        // stray commas are skipped, a backwards range names nothing
        assert_eq!(parse_cpu_list("1,,5"), Some(vec![1, 5]));
        assert_eq!(parse_cpu_list("3-1"), Some(vec![]));
    }

    #[test]
    fn test_parse_cpu_list_rejects_garbage() {
        assert_eq!(parse_cpu_list("a"), None);
        assert_eq!(parse_cpu_list("1-b"), None);
        assert_eq!(parse_cpu_list("0- 3"), None);
        assert_eq!(parse_cpu_list("1--3"), None);
    }

    #[test]
    fn test_detected_topology() {
        let topo = topology();
        assert!(topo.max_threads() >= 1);
        assert!(topo.max_sockets() >= 1);
        assert_eq!(topo.socket(0), 0);
        assert!(topo.is_leader(0));
        assert_eq!(topo.leader_for_socket(0), 0);
        assert_eq!(topo.cumulative_max_socket(0), 0);
    }

    #[test]
    fn test_leaders_are_consistent() {
        let topo = topology();
        for tid in 0..topo.max_threads() {
            let socket = topo.socket(tid);
            let leader = topo.leader(tid);
            assert_eq!(topo.socket(leader), socket);
            assert_eq!(topo.leader_for_socket(socket), leader);
            assert!(leader <= tid);
            // leaders are the lowest tid of their socket
            assert_eq!(topo.is_leader(tid), leader == tid);
        }
    }

    #[test]
    fn test_two_socket_assignment() {
        // 2 nodes with 2 cpus each, as a machine would report them
        let topo = Topology::from_cpu_assignment(vec![(0, 0), (1, 0), (2, 1), (3, 1)]);
        assert_eq!(topo.max_threads(), 4);
        assert_eq!(topo.max_sockets(), 2);
        assert_eq!(topo.socket(2), 1);
        assert!(topo.is_leader(2));
        assert!(!topo.is_leader(3));
        assert_eq!(topo.leader_for_socket(1), 2);
        assert_eq!(topo.cumulative_max_socket(1), 0);
        assert_eq!(topo.cumulative_max_socket(3), 1);
    }
}
