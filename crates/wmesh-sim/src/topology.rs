/// Pairwise direct loss between nodes.
///
/// The relation is symmetric, so only the strict upper triangle is stored.
/// Every lookup normalises `(i, j)` to `(min, max)`; the diagonal is always 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    n: usize,
    upper: Vec<u8>,
}

impl Topology {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            upper: vec![0; n * n.saturating_sub(1) / 2],
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn index(&self, i: usize, j: usize) -> Option<usize> {
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        if a == b || b >= self.n {
            return None;
        }
        // Rows before `a` hold (n-1) + (n-2) + ... + (n-a) cells.
        Some(a * (2 * self.n - a - 1) / 2 + (b - a - 1))
    }

    /// Loss percentage between `i` and `j` in either order.
    pub fn get(&self, i: usize, j: usize) -> u8 {
        self.index(i, j).map(|idx| self.upper[idx]).unwrap_or(0)
    }

    /// Sets the loss between `i` and `j`, clamped to 100. Diagonal and
    /// out-of-range writes are ignored.
    pub fn set(&mut self, i: usize, j: usize, loss: u8) {
        if let Some(idx) = self.index(i, j) {
            self.upper[idx] = loss.min(100);
        }
    }

    /// Full row for `i`, including the zero diagonal.
    pub fn row(&self, i: usize) -> Vec<u8> {
        (0..self.n).map(|j| self.get(i, j)).collect()
    }

    /// Dense symmetric matrix, mostly for display.
    pub fn to_matrix(&self) -> Vec<Vec<u8>> {
        (0..self.n).map(|i| self.row(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_order_independent() {
        let mut topo = Topology::new(4);
        topo.set(3, 1, 40);
        assert_eq!(topo.get(1, 3), 40);
        assert_eq!(topo.get(3, 1), 40);
        topo.set(1, 3, 60);
        assert_eq!(topo.get(3, 1), 60);
    }

    #[test]
    fn each_pair_has_one_cell() {
        let mut topo = Topology::new(5);
        let mut v = 1u8;
        for i in 0..5 {
            for j in (i + 1)..5 {
                topo.set(i, j, v);
                v += 1;
            }
        }
        assert_eq!(topo.upper.len(), 10);
        let mut v = 1u8;
        for i in 0..5 {
            for j in (i + 1)..5 {
                assert_eq!(topo.get(j, i), v);
                v += 1;
            }
        }
    }

    #[test]
    fn diagonal_and_bounds() {
        let mut topo = Topology::new(3);
        topo.set(1, 1, 50);
        topo.set(0, 7, 50);
        topo.set(0, 2, 250);
        assert_eq!(topo.get(1, 1), 0);
        assert_eq!(topo.get(0, 7), 0);
        assert_eq!(topo.get(2, 0), 100);
        assert_eq!(topo.row(0), vec![0, 0, 100]);
        assert_eq!(Topology::new(0).to_matrix(), Vec::<Vec<u8>>::new());
        assert!(Topology::new(1).upper.is_empty());
    }
}
