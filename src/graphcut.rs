// graphcut.rs — Min-cut over the pixel grid.
//
// The solver contract is narrow on purpose: terminal capacities plus the
// directional cue planes in, a raw label plane out. Source-side (foreground)
// pixels get a nonzero raw value; everything downstream goes through the
// thresholding in mask.rs, so the raw magnitude is the solver's choice.
// A solver must be deterministic: identical inputs, identical labels.
//
// The bundled implementation builds the explicit residual graph and runs
// Dinic's algorithm. Level-graph blocking flows are near-linear on grid
// instances, and the final source-side BFS gives the labeling directly.

use crate::energy::{EdgeCues, Neighborhood};
use crate::image::Image;
use crate::mask::RAW_FOREGROUND;

/// Global min-cut between the foreground and background terminals.
pub trait MinCutSolver {
    /// Raw label plane: nonzero for source-side pixels. Dimensions match
    /// `terminals`.
    fn solve(&self, terminals: &Image<i32>, cues: &EdgeCues) -> Image<u8>;
}

// ---------------------------------------------------------------------------
// Dinic max-flow
// ---------------------------------------------------------------------------

struct Arc {
    to: u32,
    cap: i64,
}

/// Residual graph with paired arcs: arc `i` and `i ^ 1` are reverses.
struct FlowGraph {
    arcs: Vec<Arc>,
    adj: Vec<Vec<u32>>,
    level: Vec<i32>,
    iter: Vec<usize>,
}

impl FlowGraph {
    fn new(nodes: usize) -> Self {
        FlowGraph {
            arcs: Vec::new(),
            adj: vec![Vec::new(); nodes],
            level: vec![-1; nodes],
            iter: vec![0; nodes],
        }
    }

    fn add_edge(&mut self, from: u32, to: u32, cap: i64, rev_cap: i64) {
        let i = self.arcs.len() as u32;
        self.arcs.push(Arc { to, cap });
        self.arcs.push(Arc { to: from, cap: rev_cap });
        self.adj[from as usize].push(i);
        self.adj[to as usize].push(i + 1);
    }

    fn bfs(&mut self, source: u32, sink: u32) -> bool {
        self.level.iter_mut().for_each(|l| *l = -1);
        self.level[source as usize] = 0;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(source);
        while let Some(u) = queue.pop_front() {
            for &ai in &self.adj[u as usize] {
                let arc = &self.arcs[ai as usize];
                if arc.cap > 0 && self.level[arc.to as usize] < 0 {
                    self.level[arc.to as usize] = self.level[u as usize] + 1;
                    queue.push_back(arc.to);
                }
            }
        }
        self.level[sink as usize] >= 0
    }

    fn dfs(&mut self, u: u32, sink: u32, pushed: i64) -> i64 {
        if u == sink {
            return pushed;
        }
        while self.iter[u as usize] < self.adj[u as usize].len() {
            let ai = self.adj[u as usize][self.iter[u as usize]] as usize;
            let (to, cap) = (self.arcs[ai].to, self.arcs[ai].cap);
            if cap > 0 && self.level[to as usize] == self.level[u as usize] + 1 {
                let got = self.dfs(to, sink, pushed.min(cap));
                if got > 0 {
                    self.arcs[ai].cap -= got;
                    self.arcs[ai ^ 1].cap += got;
                    return got;
                }
            }
            self.iter[u as usize] += 1;
        }
        0
    }

    fn max_flow(&mut self, source: u32, sink: u32) {
        while self.bfs(source, sink) {
            self.iter.iter_mut().for_each(|i| *i = 0);
            while self.dfs(source, sink, i64::MAX) > 0 {}
        }
    }

    /// Source side of the min cut: residual reachability from the source.
    fn source_side(&self, source: u32) -> Vec<bool> {
        let mut seen = vec![false; self.adj.len()];
        seen[source as usize] = true;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(source);
        while let Some(u) = queue.pop_front() {
            for &ai in &self.adj[u as usize] {
                let arc = &self.arcs[ai as usize];
                if arc.cap > 0 && !seen[arc.to as usize] {
                    seen[arc.to as usize] = true;
                    queue.push_back(arc.to);
                }
            }
        }
        seen
    }
}

/// Dinic's max-flow on the implicit grid graph. Deterministic: adjacency
/// order is fixed by construction.
pub struct GridDinic;

impl GridDinic {
    #[cfg(debug_assertions)]
    fn check_mirrors(cues: &EdgeCues, w: usize, h: usize) {
        for y in 0..h {
            for x in 0..w {
                if y + 1 < h {
                    debug_assert_eq!(cues.bottom.get(x, y), cues.top.get(x, y + 1));
                }
                if x + 1 < w {
                    debug_assert_eq!(cues.right_t.get(y, x), cues.left_t.get(y, x + 1));
                }
                if y + 1 < h && x + 1 < w {
                    debug_assert_eq!(cues.bottomright.get(x, y), cues.topleft.get(x + 1, y + 1));
                }
                if y + 1 < h && x > 0 {
                    debug_assert_eq!(cues.bottomleft.get(x, y), cues.topright.get(x - 1, y + 1));
                }
            }
        }
    }
}

impl MinCutSolver for GridDinic {
    fn solve(&self, terminals: &Image<i32>, cues: &EdgeCues) -> Image<u8> {
        let (w, h) = (terminals.width(), terminals.height());
        assert_eq!(cues.bottom.width(), w, "cue plane width mismatch");
        assert_eq!(cues.bottom.height(), h, "cue plane height mismatch");
        #[cfg(debug_assertions)]
        Self::check_mirrors(cues, w, h);

        let n = w * h;
        let source = n as u32;
        let sink = (n + 1) as u32;
        let mut graph = FlowGraph::new(n + 2);
        let node = |x: usize, y: usize| (y * w + x) as u32;

        for y in 0..h {
            for x in 0..w {
                let t = terminals.get(x, y) as i64;
                if t > 0 {
                    graph.add_edge(source, node(x, y), t, 0);
                } else if t < 0 {
                    graph.add_edge(node(x, y), sink, -t, 0);
                }
            }
        }
        // Each undirected pair once, from the bottom/right-facing planes;
        // the mirror planes were asserted consistent above.
        for y in 0..h {
            for x in 0..w {
                if x + 1 < w {
                    let c = cues.right_t.get(y, x) as i64;
                    if c > 0 {
                        graph.add_edge(node(x, y), node(x + 1, y), c, c);
                    }
                }
                if y + 1 < h {
                    let c = cues.bottom.get(x, y) as i64;
                    if c > 0 {
                        graph.add_edge(node(x, y), node(x, y + 1), c, c);
                    }
                }
                if cues.neighborhood == Neighborhood::Eight && y + 1 < h {
                    if x + 1 < w {
                        let c = cues.bottomright.get(x, y) as i64;
                        if c > 0 {
                            graph.add_edge(node(x, y), node(x + 1, y + 1), c, c);
                        }
                    }
                    if x > 0 {
                        let c = cues.bottomleft.get(x, y) as i64;
                        if c > 0 {
                            graph.add_edge(node(x, y), node(x - 1, y + 1), c, c);
                        }
                    }
                }
            }
        }

        graph.max_flow(source, sink);
        let reachable = graph.source_side(source);

        let mut labels = Image::<u8>::new(w, h);
        for y in 0..h {
            for x in 0..w {
                if reachable[node(x, y) as usize] {
                    labels.set(x, y, RAW_FOREGROUND);
                }
            }
        }
        labels
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::TERMINAL_LOCK;

    fn zero_cues(w: usize, h: usize, neighborhood: Neighborhood) -> EdgeCues {
        EdgeCues {
            top: Image::new(w, h),
            bottom: Image::new(w, h),
            topleft: Image::new(w, h),
            topright: Image::new(w, h),
            bottomleft: Image::new(w, h),
            bottomright: Image::new(w, h),
            left_t: Image::new(h, w),
            right_t: Image::new(h, w),
            neighborhood,
        }
    }

    fn set_horizontal(cues: &mut EdgeCues, x: usize, y: usize, v: i32) {
        cues.right_t.set(y, x, v);
        cues.left_t.set(y, x + 1, v);
    }

    fn set_vertical(cues: &mut EdgeCues, x: usize, y: usize, v: i32) {
        cues.bottom.set(x, y, v);
        cues.top.set(x, y + 1, v);
    }

    fn set_diag_right(cues: &mut EdgeCues, x: usize, y: usize, v: i32) {
        cues.bottomright.set(x, y, v);
        cues.topleft.set(x + 1, y + 1, v);
    }

    #[test]
    fn test_isolated_pixels_follow_terminal_sign() {
        let terminals = Image::<i32>::from_vec(3, 1, vec![10, 0, -10]);
        let cues = zero_cues(3, 1, Neighborhood::Four);
        let labels = GridDinic.solve(&terminals, &cues);
        assert_eq!(labels.row(0), &[RAW_FOREGROUND, 0, 0]);
    }

    #[test]
    fn test_raw_output_is_zero_or_255() {
        let terminals = Image::<i32>::from_vec(2, 2, vec![5, -5, 0, 7]);
        let cues = zero_cues(2, 2, Neighborhood::Four);
        let labels = GridDinic.solve(&terminals, &cues);
        assert!(labels.pixels().all(|(_, _, v)| v == 0 || v == RAW_FOREGROUND));
    }

    #[test]
    fn test_strong_cue_pulls_neighbor_across() {
        // Pixel 0 locked foreground; pixel 1 weakly background. The cue
        // between them outweighs the pull, so the cut goes around both.
        let terminals = Image::<i32>::from_vec(2, 1, vec![TERMINAL_LOCK, -10]);
        let mut cues = zero_cues(2, 1, Neighborhood::Four);
        set_horizontal(&mut cues, 0, 0, 1000);
        let labels = GridDinic.solve(&terminals, &cues);
        assert_eq!(labels.row(0), &[RAW_FOREGROUND, RAW_FOREGROUND]);
    }

    #[test]
    fn test_weak_cue_lets_terminal_win() {
        let terminals = Image::<i32>::from_vec(2, 1, vec![TERMINAL_LOCK, -1000]);
        let mut cues = zero_cues(2, 1, Neighborhood::Four);
        set_horizontal(&mut cues, 0, 0, 10);
        let labels = GridDinic.solve(&terminals, &cues);
        assert_eq!(labels.row(0), &[RAW_FOREGROUND, 0]);
    }

    #[test]
    fn test_locked_pixels_never_flip() {
        // One foreground lock surrounded by background locks with strong
        // cues to each: the lock magnitude must dominate.
        let mut terminals = Image::<i32>::new(3, 3);
        terminals.fill(-TERMINAL_LOCK);
        terminals.set(1, 1, TERMINAL_LOCK);
        let mut cues = zero_cues(3, 3, Neighborhood::Four);
        for y in 0..3 {
            for x in 0..2 {
                set_horizontal(&mut cues, x, y, 100_000);
            }
        }
        for y in 0..2 {
            for x in 0..3 {
                set_vertical(&mut cues, x, y, 100_000);
            }
        }
        let labels = GridDinic.solve(&terminals, &cues);
        assert_eq!(labels.get(1, 1), RAW_FOREGROUND);
        assert_eq!(labels.get(0, 0), 0);
        assert_eq!(labels.get(2, 2), 0);
    }

    #[test]
    fn test_diagonal_connectivity_in_eight_neighborhood() {
        // A foreground seed connected to a neutral pixel only diagonally.
        let mut terminals = Image::<i32>::new(2, 2);
        terminals.set(0, 0, TERMINAL_LOCK);
        terminals.set(1, 1, -10);
        terminals.set(1, 0, -TERMINAL_LOCK);
        terminals.set(0, 1, -TERMINAL_LOCK);
        let mut cues = zero_cues(2, 2, Neighborhood::Eight);
        set_diag_right(&mut cues, 0, 0, 1000);
        let labels = GridDinic.solve(&terminals, &cues);
        assert_eq!(labels.get(1, 1), RAW_FOREGROUND);
    }

    #[test]
    fn test_cut_follows_contrast_seam() {
        // Left column locked foreground, right column locked background,
        // uniform strong cues except a weak seam down the middle: the cut
        // must run along the seam.
        let w = 6;
        let h = 4;
        let mut terminals = Image::<i32>::new(w, h);
        for y in 0..h {
            terminals.set(0, y, TERMINAL_LOCK);
            terminals.set(w - 1, y, -TERMINAL_LOCK);
        }
        let mut cues = zero_cues(w, h, Neighborhood::Four);
        for y in 0..h {
            for x in 0..w - 1 {
                let v = if x == 2 { 1 } else { 10_000 };
                set_horizontal(&mut cues, x, y, v);
            }
        }
        for y in 0..h - 1 {
            for x in 0..w {
                set_vertical(&mut cues, x, y, 10_000);
            }
        }
        let labels = GridDinic.solve(&terminals, &cues);
        for y in 0..h {
            for x in 0..w {
                let expect = if x <= 2 { RAW_FOREGROUND } else { 0 };
                assert_eq!(labels.get(x, y), expect, "at ({x},{y})");
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let mut terminals = Image::<i32>::new(8, 8);
        let mut state = 0x2545F4914F6CDD1Du64;
        for y in 0..8 {
            for x in 0..8 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                terminals.set(x, y, ((state >> 33) as i32 % 2001) - 1000);
            }
        }
        let mut cues = zero_cues(8, 8, Neighborhood::Four);
        for y in 0..8 {
            for x in 0..7 {
                set_horizontal(&mut cues, x, y, ((x + y) % 7) as i32 * 50);
            }
        }
        for y in 0..7 {
            for x in 0..8 {
                set_vertical(&mut cues, x, y, ((x * y) % 5) as i32 * 50);
            }
        }
        let a = GridDinic.solve(&terminals, &cues);
        let b = GridDinic.solve(&terminals, &cues);
        assert!(crate::mask::planes_equal(&a, &b));
    }
}
