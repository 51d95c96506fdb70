//! Differentiable tensor operations.

use super::{Op, Var};
use crate::{MAMLError, Result};
use ndarray::{Array2, Axis};

impl<'g> Var<'g> {
    fn expect_same_shape(&self, other: &Var<'g>, op: &str) -> Result<()> {
        let (lhs, rhs) = (self.shape(), other.shape());
        if lhs != rhs {
            return Err(MAMLError::ShapeMismatch(format!(
                "{op}: {lhs:?} vs {rhs:?}"
            )));
        }
        Ok(())
    }

    pub fn add(self, other: Var<'g>) -> Result<Var<'g>> {
        self.expect_same_shape(&other, "add")?;
        let value = &*self.data() + &*other.data();
        Ok(self.graph.record(value, Op::Add(self.id, other.id)))
    }

    pub fn sub(self, other: Var<'g>) -> Result<Var<'g>> {
        self.expect_same_shape(&other, "sub")?;
        let value = &*self.data() - &*other.data();
        Ok(self.graph.record(value, Op::Sub(self.id, other.id)))
    }

    /// Elementwise product
    pub fn mul(self, other: Var<'g>) -> Result<Var<'g>> {
        self.expect_same_shape(&other, "mul")?;
        let value = &*self.data() * &*other.data();
        Ok(self.graph.record(value, Op::Mul(self.id, other.id)))
    }

    /// Elementwise quotient
    pub fn div(self, other: Var<'g>) -> Result<Var<'g>> {
        self.expect_same_shape(&other, "div")?;
        let value = &*self.data() / &*other.data();
        Ok(self.graph.record(value, Op::Div(self.id, other.id)))
    }

    /// Matrix product `[m, k] x [k, n] -> [m, n]`
    pub fn matmul(self, other: Var<'g>) -> Result<Var<'g>> {
        let ((m, k), (k2, n)) = (self.shape(), other.shape());
        if k != k2 {
            return Err(MAMLError::ShapeMismatch(format!(
                "matmul: ({m}, {k}) x ({k2}, {n})"
            )));
        }
        let value = self.data().dot(&*other.data());
        Ok(self.graph.record(value, Op::MatMul(self.id, other.id)))
    }

    /// Transpose
    pub fn t(self) -> Var<'g> {
        let value = self.data().t().to_owned();
        self.graph.record(value, Op::Transpose(self.id))
    }

    /// Multiply by a constant scalar
    pub fn scale(self, factor: f64) -> Var<'g> {
        let value = &*self.data() * factor;
        self.graph.record(value, Op::Scale(self.id, factor))
    }

    pub fn neg(self) -> Var<'g> {
        self.scale(-1.0)
    }

    /// Add a `[1, n]` row to every row of an `[m, n]` tensor
    pub fn add_row(self, row: Var<'g>) -> Result<Var<'g>> {
        let ((_, n), (r, c)) = (self.shape(), row.shape());
        if r != 1 || c != n {
            return Err(MAMLError::ShapeMismatch(format!(
                "add_row: row {:?} does not broadcast over {:?}",
                (r, c),
                self.shape()
            )));
        }
        let mut value = (*self.data()).clone();
        value += &*row.data();
        Ok(self.graph.record(value, Op::AddRow(self.id, row.id)))
    }

    /// Sum of all elements as a `1 x 1` tensor
    pub fn sum(self) -> Var<'g> {
        let value = Array2::from_elem((1, 1), self.data().sum());
        self.graph.record(value, Op::Sum(self.id))
    }

    /// Column sums, `[m, n] -> [1, n]`
    pub fn sum_rows(self) -> Var<'g> {
        let value = self.data().sum_axis(Axis(0)).insert_axis(Axis(0));
        self.graph.record(value, Op::SumRows(self.id))
    }

    /// Row sums, `[m, n] -> [m, 1]`
    pub fn sum_cols(self) -> Var<'g> {
        let value = self.data().sum_axis(Axis(1)).insert_axis(Axis(1));
        self.graph.record(value, Op::SumCols(self.id))
    }

    /// Repeat a `[1, n]` row `rows` times
    pub fn broadcast_rows(self, rows: usize) -> Result<Var<'g>> {
        let (r, n) = self.shape();
        if r != 1 {
            return Err(MAMLError::ShapeMismatch(format!(
                "broadcast_rows: expected a single row, got {:?}",
                (r, n)
            )));
        }
        let value = self
            .data()
            .broadcast((rows, n))
            .map(|view| view.to_owned())
            .ok_or_else(|| MAMLError::ShapeMismatch(format!("broadcast_rows to ({rows}, {n})")))?;
        Ok(self.graph.record(value, Op::BroadcastRows(self.id)))
    }

    /// Repeat a `[m, 1]` column `cols` times
    pub fn broadcast_cols(self, cols: usize) -> Result<Var<'g>> {
        let (m, c) = self.shape();
        if c != 1 {
            return Err(MAMLError::ShapeMismatch(format!(
                "broadcast_cols: expected a single column, got {:?}",
                (m, c)
            )));
        }
        let value = self
            .data()
            .broadcast((m, cols))
            .map(|view| view.to_owned())
            .ok_or_else(|| MAMLError::ShapeMismatch(format!("broadcast_cols to ({m}, {cols})")))?;
        Ok(self.graph.record(value, Op::BroadcastCols(self.id)))
    }

    /// Expand a `1 x 1` tensor to `shape`
    pub fn fill(self, shape: (usize, usize)) -> Result<Var<'g>> {
        if self.shape() != (1, 1) {
            return Err(MAMLError::ShapeMismatch(format!(
                "fill: expected (1, 1), got {:?}",
                self.shape()
            )));
        }
        let value = Array2::from_elem(shape, self.item());
        Ok(self.graph.record(value, Op::Fill(self.id)))
    }

    pub fn tanh(self) -> Var<'g> {
        let value = self.data().mapv(f64::tanh);
        self.graph.record(value, Op::Tanh(self.id))
    }

    pub fn relu(self) -> Var<'g> {
        let value = self.data().mapv(|x| x.max(0.0));
        self.graph.record(value, Op::Relu(self.id))
    }

    pub fn exp(self) -> Var<'g> {
        let value = self.data().mapv(f64::exp);
        self.graph.record(value, Op::Exp(self.id))
    }

    /// Natural logarithm
    pub fn ln(self) -> Var<'g> {
        let value = self.data().mapv(f64::ln);
        self.graph.record(value, Op::Ln(self.id))
    }
}

#[cfg(test)]
mod tests {
    use crate::autograd::Graph;
    use crate::MAMLError;
    use ndarray::array;

    #[test]
    fn test_elementwise_values() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0, 2.0], [3.0, 4.0]]);
        let b = graph.constant(array![[2.0, 2.0], [2.0, 2.0]]);

        assert_eq!(a.add(b).unwrap().value(), array![[3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(a.sub(b).unwrap().value(), array![[-1.0, 0.0], [1.0, 2.0]]);
        assert_eq!(a.mul(b).unwrap().value(), array![[2.0, 4.0], [6.0, 8.0]]);
        assert_eq!(a.div(b).unwrap().value(), array![[0.5, 1.0], [1.5, 2.0]]);
        assert_eq!(a.neg().value(), array![[-1.0, -2.0], [-3.0, -4.0]]);
    }

    #[test]
    fn test_matmul_and_transpose() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0, 2.0, 3.0]]);
        let b = graph.param(array![[1.0], [0.0], [2.0]]);

        let c = a.matmul(b).unwrap();
        assert_eq!(c.value(), array![[7.0]]);
        assert_eq!(a.t().shape(), (3, 1));
    }

    #[test]
    fn test_shape_mismatch() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0, 2.0]]);
        let b = graph.param(array![[1.0, 2.0, 3.0]]);

        assert!(matches!(a.add(b), Err(MAMLError::ShapeMismatch(_))));
        assert!(matches!(a.matmul(b), Err(MAMLError::ShapeMismatch(_))));
        assert!(matches!(b.add_row(a), Err(MAMLError::ShapeMismatch(_))));
        assert!(matches!(a.fill((2, 2)), Err(MAMLError::ShapeMismatch(_))));
    }

    #[test]
    fn test_reductions_and_broadcasts() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);

        assert_eq!(a.sum().item(), 21.0);
        assert_eq!(a.sum_rows().value(), array![[9.0, 12.0]]);
        assert_eq!(a.sum_cols().value(), array![[3.0], [7.0], [11.0]]);

        let row = graph.param(array![[10.0, 20.0]]);
        assert_eq!(
            a.add_row(row).unwrap().value(),
            array![[11.0, 22.0], [13.0, 24.0], [15.0, 26.0]]
        );
        assert_eq!(row.broadcast_rows(2).unwrap().value(), array![[10.0, 20.0], [10.0, 20.0]]);

        let col = graph.param(array![[1.0], [2.0]]);
        assert_eq!(col.broadcast_cols(3).unwrap().value(), array![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]);
        assert_eq!(graph.scalar(1.5).fill((1, 2)).unwrap().value(), array![[1.5, 1.5]]);
    }

    #[test]
    fn test_unary_values() {
        let graph = Graph::new();
        let a = graph.param(array![[0.0, -1.0, 2.0]]);

        assert_eq!(a.relu().value(), array![[0.0, 0.0, 2.0]]);
        assert_eq!(a.tanh().value()[[0, 0]], 0.0);
        assert_eq!(a.exp().value()[[0, 0]], 1.0);
        assert!((a.exp().ln().value()[[0, 2]] - 2.0).abs() < 1e-12);
    }
}
