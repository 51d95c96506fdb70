//! Reverse sweep over the graph.
//!
//! Backward rules build their results out of ordinary graph ops. With
//! `create_graph` the gradient subgraph is tracked like any forward
//! computation, which is what makes second-order gradients possible.

use super::{Graph, Op, Var};
use crate::{MAMLError, Result};
use ndarray::Array2;

impl Graph {
    /// Gradients of `output` with respect to each variable in `wrt`.
    ///
    /// A non-scalar `output` is treated as the sum of its elements. Variables
    /// that `output` does not depend on receive a zero gradient of their own
    /// shape. When `create_graph` is false the gradients are constants.
    ///
    /// Fails with [`MAMLError::NonDifferentiable`] if `output` does not depend
    /// on any trainable variable, e.g. because it was computed under
    /// [`Graph::no_grad`].
    pub fn grad<'g>(
        &'g self,
        output: Var<'g>,
        wrt: &[Var<'g>],
        create_graph: bool,
    ) -> Result<Vec<Var<'g>>> {
        if !std::ptr::eq(output.graph, self) {
            return Err(MAMLError::InvalidInput(
                "output variable belongs to a different graph".to_string(),
            ));
        }
        if !output.requires_grad() {
            return Err(MAMLError::NonDifferentiable(format!(
                "node {} does not depend on any trainable variable",
                output.id
            )));
        }

        let _mode = self.grad_mode(create_graph);
        let root = output.id;
        let mut grads: Vec<Option<Var<'g>>> = vec![None; root + 1];
        grads[root] = Some(self.constant(Array2::ones(output.shape())));

        for id in (0..=root).rev() {
            let Some(upstream) = grads[id] else {
                continue;
            };
            if !self.requires_grad(id) {
                continue;
            }
            let node = Var { graph: self, id };
            for (input, contribution) in self.backward_rule(node, upstream)? {
                grads[input] = Some(match grads[input] {
                    Some(previous) => previous.add(contribution)?,
                    None => contribution,
                });
            }
        }

        wrt.iter()
            .map(|var| match grads.get(var.id).copied().flatten() {
                Some(grad) => Ok(grad),
                None => Ok(self.constant(Array2::zeros(var.shape()))),
            })
            .collect()
    }

    /// Gradient contributions of `node` to each of its trainable inputs
    fn backward_rule<'g>(
        &'g self,
        node: Var<'g>,
        upstream: Var<'g>,
    ) -> Result<Vec<(usize, Var<'g>)>> {
        let var = |id: usize| Var { graph: self, id };
        let needs = |id: usize| self.requires_grad(id);
        let g = upstream;
        let mut out = Vec::with_capacity(2);

        match self.op_of(node.id) {
            Op::Leaf => {}
            Op::Add(a, b) => {
                if needs(a) {
                    out.push((a, g));
                }
                if needs(b) {
                    out.push((b, g));
                }
            }
            Op::Sub(a, b) => {
                if needs(a) {
                    out.push((a, g));
                }
                if needs(b) {
                    out.push((b, g.neg()));
                }
            }
            Op::Mul(a, b) => {
                if needs(a) {
                    out.push((a, g.mul(var(b))?));
                }
                if needs(b) {
                    out.push((b, g.mul(var(a))?));
                }
            }
            Op::Div(a, b) => {
                if needs(a) {
                    out.push((a, g.div(var(b))?));
                }
                if needs(b) {
                    // d(a/b)/db = -(a/b)/b
                    out.push((b, g.mul(node)?.div(var(b))?.neg()));
                }
            }
            Op::MatMul(a, b) => {
                if needs(a) {
                    out.push((a, g.matmul(var(b).t())?));
                }
                if needs(b) {
                    out.push((b, var(a).t().matmul(g)?));
                }
            }
            Op::Transpose(a) => out.push((a, g.t())),
            Op::Scale(a, factor) => out.push((a, g.scale(factor))),
            Op::AddRow(a, row) => {
                if needs(a) {
                    out.push((a, g));
                }
                if needs(row) {
                    out.push((row, g.sum_rows()));
                }
            }
            Op::Sum(a) => out.push((a, g.fill(var(a).shape())?)),
            Op::SumRows(a) => out.push((a, g.broadcast_rows(var(a).shape().0)?)),
            Op::SumCols(a) => out.push((a, g.broadcast_cols(var(a).shape().1)?)),
            Op::BroadcastRows(a) => out.push((a, g.sum_rows())),
            Op::BroadcastCols(a) => out.push((a, g.sum_cols())),
            Op::Fill(a) => out.push((a, g.sum())),
            Op::Tanh(a) => {
                // g * (1 - y^2)
                let damped = g.mul(node)?.mul(node)?;
                out.push((a, g.sub(damped)?));
            }
            Op::Relu(a) => {
                let mask = self.constant(var(a).data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 }));
                out.push((a, g.mul(mask)?));
            }
            Op::Exp(a) => out.push((a, g.mul(node)?)),
            Op::Ln(a) => out.push((a, g.div(var(a))?)),
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::autograd::{Graph, Var};
    use crate::{MAMLError, Result};
    use ndarray::{array, Array2};

    /// Central finite differences of a scalar function of one tensor
    fn numerical_grad(x: &Array2<f64>, f: impl Fn(&Array2<f64>) -> f64) -> Array2<f64> {
        let eps = 1e-6;
        let mut grad = Array2::zeros(x.dim());
        for ((i, j), _) in x.indexed_iter() {
            let mut plus = x.clone();
            plus[[i, j]] += eps;
            let mut minus = x.clone();
            minus[[i, j]] -= eps;
            grad[[i, j]] = (f(&plus) - f(&minus)) / (2.0 * eps);
        }
        grad
    }

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {} (tol {})", x, y, tol);
        }
    }

    /// A function touching every backward rule
    fn composite<'g>(x: Var<'g>, w: Var<'g>, bias: Var<'g>) -> Result<Var<'g>> {
        let graph = x.graph();
        let h = x.matmul(w)?.add_row(bias)?.tanh();
        let r = h.relu().add(h.exp())?;
        let positive = r.add(graph.constant(Array2::from_elem(r.shape(), 2.0)))?;
        let logged = positive.ln().div(positive)?;
        let mixed = logged.mul(h)?.sub(h.scale(0.3))?;
        let reduced = mixed.sum_cols().broadcast_cols(2)?.sum_rows().t();
        let total = reduced.sum().fill((2, 2))?;
        Ok(total.mul(graph.constant(array![[1.0, 0.5], [0.25, 0.125]]))?.sum())
    }

    fn tanh_energy<'g>(w: Var<'g>, x: &Array2<f64>) -> Result<Var<'g>> {
        let z = w.graph().constant(x.clone()).matmul(w)?.tanh();
        Ok(z.mul(z)?.exp().sum())
    }

    #[test]
    fn test_first_order_matches_finite_differences() {
        let x0 = array![[0.3, -0.2, 0.5], [0.1, 0.4, -0.6]];
        let w0 = array![[0.2, -0.1], [0.05, 0.3], [-0.4, 0.25]];
        let b0 = array![[0.1, -0.2]];

        let graph = Graph::new();
        let x = graph.constant(x0.clone());
        let w = graph.param(w0.clone());
        let b = graph.param(b0.clone());
        let loss = composite(x, w, b).unwrap();
        let grads = graph.grad(loss, &[w, b], false).unwrap();

        let eval = |w: &Array2<f64>, b: &Array2<f64>| {
            let g = Graph::new();
            composite(g.constant(x0.clone()), g.param(w.clone()), g.param(b.clone()))
                .unwrap()
                .item()
        };
        let num_w = numerical_grad(&w0, |w| eval(w, &b0));
        let num_b = numerical_grad(&b0, |b| eval(&w0, b));

        assert_close(&grads[0].value(), &num_w, 1e-6);
        assert_close(&grads[1].value(), &num_b, 1e-6);
        assert!(!grads[0].requires_grad());
    }

    #[test]
    fn test_second_order_matches_finite_differences() {
        // h(w) = sum(grad_w f(w) * v), whose gradient is the Hessian-vector product
        let w0 = array![[0.4, -0.3], [0.2, 0.1]];
        let v = array![[1.0, -0.5], [0.25, 2.0]];
        let x0 = array![[0.7, -0.2], [0.3, 0.9], [-0.5, 0.4]];

        let hvp = |w_val: &Array2<f64>| -> (f64, Array2<f64>) {
            let graph = Graph::new();
            let w = graph.param(w_val.clone());
            let loss = tanh_energy(w, &x0).unwrap();
            let g = graph.grad(loss, &[w], true).unwrap()[0];
            let h = g.mul(graph.constant(v.clone())).unwrap().sum();
            let hw = graph.grad(h, &[w], false).unwrap()[0];
            (h.item(), hw.value())
        };

        let (_, analytic) = hvp(&w0);
        let numeric = numerical_grad(&w0, |w| hvp(w).0);
        assert_close(&analytic, &numeric, 1e-5);
    }

    #[test]
    fn test_unreached_variable_gets_zero_gradient() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0, 2.0]]);
        let unused = graph.param(array![[3.0], [4.0]]);
        let loss = a.mul(a).unwrap().sum();

        let grads = graph.grad(loss, &[a, unused], false).unwrap();
        assert_eq!(grads[0].value(), array![[2.0, 4.0]]);
        assert_eq!(grads[1].value(), Array2::<f64>::zeros((2, 1)));
    }

    #[test]
    fn test_shared_input_accumulates() {
        let graph = Graph::new();
        let a = graph.param(array![[3.0]]);
        // a * a + a  ->  2a + 1
        let y = a.mul(a).unwrap().add(a).unwrap();
        let grads = graph.grad(y, &[a], false).unwrap();
        assert_eq!(grads[0].item(), 7.0);
    }

    #[test]
    fn test_untracked_output_is_non_differentiable() {
        let graph = Graph::new();
        let a = graph.param(array![[1.0]]);
        let y = graph.no_grad(|| a.exp().sum());

        assert!(matches!(
            graph.grad(y, &[a], false),
            Err(MAMLError::NonDifferentiable(_))
        ));
    }

    #[test]
    fn test_create_graph_tracks_gradients() {
        let graph = Graph::new();
        let a = graph.param(array![[2.0]]);
        let y = a.mul(a).unwrap().mul(a).unwrap().sum();

        let g = graph.grad(y, &[a], true).unwrap()[0];
        assert!(g.requires_grad());
        assert_eq!(g.item(), 12.0);

        let gg = graph.grad(g, &[a], false).unwrap()[0];
        assert_eq!(gg.item(), 12.0);
    }
}
