//! 逆伝播テープ
//!
//! 行優先の f64 行列に対する最小限のリバースモード自動微分。
//! 記述子に関する1階・2階微分は前進方向のジェットとしてテープ上に積み、
//! 力・回転ペナルティを含む損失のパラメータ勾配を一回の `backward` で得る。

/// 行優先の密行列
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    /// 列ベクトル
    pub fn column(data: Vec<f64>) -> Self {
        let rows = data.len();
        Self::from_vec(rows, 1, data)
    }

    /// 行ベクトル
    pub fn row(data: Vec<f64>) -> Self {
        let cols = data.len();
        Self::from_vec(1, cols, data)
    }

    pub fn scalar(value: f64) -> Self {
        Self::from_vec(1, 1, vec![value])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    /// 1x1 行列の値
    pub fn item(&self) -> f64 {
        debug_assert_eq!(self.data.len(), 1);
        self.data[0]
    }

    fn same_shape(&self, other: &Matrix) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix::from_vec(self.rows, self.cols, self.data.iter().map(|&x| f(x)).collect())
    }

    fn zip(&self, other: &Matrix, f: impl Fn(f64, f64) -> f64) -> Matrix {
        debug_assert!(self.same_shape(other), "shape mismatch");
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Matrix::from_vec(self.rows, self.cols, data)
    }

    fn add_assign(&mut self, other: &Matrix) {
        debug_assert!(self.same_shape(other), "shape mismatch");
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }
}

/// テープ上のノード参照
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Var(usize);

enum Op {
    Leaf,
    MatMul(Var, Var),
    /// (r x c) + (r x 1) を列方向にブロードキャスト
    AddCol(Var, Var),
    /// (r x c) * (r x 1) を列方向にブロードキャスト
    MulCol(Var, Var),
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Scale(Var, f64),
    AddScalar(Var),
    Square(Var),
    Abs(Var),
    Sqrt(Var),
    Tanh(Var),
    GuardedDiv(Var, Var, f64),
    SelectCols(Var, Vec<usize>),
    Sum(Var),
    Mean(Var),
}

struct Node {
    value: Matrix,
    op: Op,
}

/// 計算グラフ
#[derive(Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, value: Matrix, op: Op) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    /// パラメータまたは定数
    pub fn leaf(&mut self, value: Matrix) -> Var {
        self.push(value, Op::Leaf)
    }

    pub fn value(&self, v: Var) -> &Matrix {
        &self.nodes[v.0].value
    }

    pub fn matmul(&mut self, a: Var, b: Var) -> Var {
        let (x, y) = (self.value(a), self.value(b));
        debug_assert_eq!(x.cols, y.rows);
        let mut out = Matrix::zeros(x.rows, y.cols);
        for i in 0..x.rows {
            for p in 0..x.cols {
                let xv = x.get(i, p);
                if xv == 0.0 {
                    continue;
                }
                let row = &y.data[p * y.cols..(p + 1) * y.cols];
                let dst = &mut out.data[i * y.cols..(i + 1) * y.cols];
                for (d, &yv) in dst.iter_mut().zip(row) {
                    *d += xv * yv;
                }
            }
        }
        self.push(out, Op::MatMul(a, b))
    }

    pub fn add_col(&mut self, a: Var, col: Var) -> Var {
        let (x, c) = (self.value(a), self.value(col));
        debug_assert_eq!(c.cols, 1);
        debug_assert_eq!(x.rows, c.rows);
        let mut out = x.clone();
        for i in 0..x.rows {
            for j in 0..x.cols {
                out.data[i * x.cols + j] += c.data[i];
            }
        }
        self.push(out, Op::AddCol(a, col))
    }

    pub fn mul_col(&mut self, a: Var, col: Var) -> Var {
        let (x, c) = (self.value(a), self.value(col));
        debug_assert_eq!(c.cols, 1);
        debug_assert_eq!(x.rows, c.rows);
        let mut out = x.clone();
        for i in 0..x.rows {
            for j in 0..x.cols {
                out.data[i * x.cols + j] *= c.data[i];
            }
        }
        self.push(out, Op::MulCol(a, col))
    }

    pub fn add(&mut self, a: Var, b: Var) -> Var {
        let out = self.value(a).zip(self.value(b), |x, y| x + y);
        self.push(out, Op::Add(a, b))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        let out = self.value(a).zip(self.value(b), |x, y| x - y);
        self.push(out, Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        let out = self.value(a).zip(self.value(b), |x, y| x * y);
        self.push(out, Op::Mul(a, b))
    }

    pub fn scale(&mut self, a: Var, s: f64) -> Var {
        let out = self.value(a).map(|x| x * s);
        self.push(out, Op::Scale(a, s))
    }

    pub fn neg(&mut self, a: Var) -> Var {
        self.scale(a, -1.0)
    }

    pub fn add_scalar(&mut self, a: Var, s: f64) -> Var {
        let out = self.value(a).map(|x| x + s);
        self.push(out, Op::AddScalar(a))
    }

    pub fn square(&mut self, a: Var) -> Var {
        let out = self.value(a).map(|x| x * x);
        self.push(out, Op::Square(a))
    }

    pub fn abs(&mut self, a: Var) -> Var {
        let out = self.value(a).map(f64::abs);
        self.push(out, Op::Abs(a))
    }

    /// 平方根。値が 0 の点での勾配は 0 とする
    pub fn sqrt(&mut self, a: Var) -> Var {
        let out = self.value(a).map(f64::sqrt);
        self.push(out, Op::Sqrt(a))
    }

    pub fn tanh(&mut self, a: Var) -> Var {
        let out = self.value(a).map(f64::tanh);
        self.push(out, Op::Tanh(a))
    }

    /// `|b| <= eps` の要素は値・勾配ともに 0 になる除算
    pub fn guarded_div(&mut self, a: Var, b: Var, eps: f64) -> Var {
        let out = self
            .value(a)
            .zip(self.value(b), |x, y| if y.abs() > eps { x / y } else { 0.0 });
        self.push(out, Op::GuardedDiv(a, b, eps))
    }

    /// 列の取り出し (重複可)。out[:, j] = a[:, idx[j]]
    pub fn select_cols(&mut self, a: Var, idx: Vec<usize>) -> Var {
        let x = self.value(a);
        let mut out = Matrix::zeros(x.rows, idx.len());
        for i in 0..x.rows {
            for (j, &src) in idx.iter().enumerate() {
                out.data[i * idx.len() + j] = x.get(i, src);
            }
        }
        self.push(out, Op::SelectCols(a, idx))
    }

    pub fn sum(&mut self, a: Var) -> Var {
        let total = self.value(a).data.iter().sum();
        self.push(Matrix::scalar(total), Op::Sum(a))
    }

    pub fn mean(&mut self, a: Var) -> Var {
        let x = self.value(a);
        let mean = if x.is_empty() {
            0.0
        } else {
            x.data.iter().sum::<f64>() / x.len() as f64
        };
        self.push(Matrix::scalar(mean), Op::Mean(a))
    }

    /// `root` から全ノードへの勾配を計算する
    pub fn backward(&self, root: Var) -> Gradients {
        let mut grads: Vec<Option<Matrix>> = vec![None; self.nodes.len()];
        let seed = &self.nodes[root.0].value;
        grads[root.0] = Some(Matrix::from_vec(seed.rows, seed.cols, vec![1.0; seed.len()]));

        for i in (0..=root.0).rev() {
            let g = match &grads[i] {
                Some(g) => g.clone(),
                None => continue,
            };
            let node = &self.nodes[i];
            match &node.op {
                Op::Leaf => {}
                Op::MatMul(a, b) => {
                    let (x, y) = (self.value(*a), self.value(*b));
                    let mut da = Matrix::zeros(x.rows, x.cols);
                    let mut db = Matrix::zeros(y.rows, y.cols);
                    for r in 0..g.rows {
                        for c in 0..g.cols {
                            let gv = g.get(r, c);
                            if gv == 0.0 {
                                continue;
                            }
                            for p in 0..x.cols {
                                da.data[r * x.cols + p] += gv * y.get(p, c);
                                db.data[p * y.cols + c] += gv * x.get(r, p);
                            }
                        }
                    }
                    accumulate(&mut grads, *a, da);
                    accumulate(&mut grads, *b, db);
                }
                Op::AddCol(a, col) => {
                    let mut dc = Matrix::zeros(g.rows, 1);
                    for r in 0..g.rows {
                        dc.data[r] = g.data[r * g.cols..(r + 1) * g.cols].iter().sum();
                    }
                    accumulate(&mut grads, *a, g);
                    accumulate(&mut grads, *col, dc);
                }
                Op::MulCol(a, col) => {
                    let (x, c) = (self.value(*a), self.value(*col));
                    let mut da = g.clone();
                    let mut dc = Matrix::zeros(c.rows, 1);
                    for r in 0..g.rows {
                        for k in 0..g.cols {
                            let idx = r * g.cols + k;
                            da.data[idx] = g.data[idx] * c.data[r];
                            dc.data[r] += g.data[idx] * x.data[idx];
                        }
                    }
                    accumulate(&mut grads, *a, da);
                    accumulate(&mut grads, *col, dc);
                }
                Op::Add(a, b) => {
                    accumulate(&mut grads, *a, g.clone());
                    accumulate(&mut grads, *b, g);
                }
                Op::Sub(a, b) => {
                    accumulate(&mut grads, *b, g.map(|x| -x));
                    accumulate(&mut grads, *a, g);
                }
                Op::Mul(a, b) => {
                    let da = g.zip(self.value(*b), |gv, y| gv * y);
                    let db = g.zip(self.value(*a), |gv, x| gv * x);
                    accumulate(&mut grads, *a, da);
                    accumulate(&mut grads, *b, db);
                }
                Op::Scale(a, s) => {
                    let s = *s;
                    accumulate(&mut grads, *a, g.map(|x| x * s));
                }
                Op::AddScalar(a) => accumulate(&mut grads, *a, g),
                Op::Square(a) => {
                    let da = g.zip(self.value(*a), |gv, x| 2.0 * x * gv);
                    accumulate(&mut grads, *a, da);
                }
                Op::Abs(a) => {
                    let da = g.zip(self.value(*a), |gv, x| {
                        if x > 0.0 {
                            gv
                        } else if x < 0.0 {
                            -gv
                        } else {
                            0.0
                        }
                    });
                    accumulate(&mut grads, *a, da);
                }
                Op::Sqrt(a) => {
                    let da = g.zip(&node.value, |gv, y| if y > 0.0 { 0.5 * gv / y } else { 0.0 });
                    accumulate(&mut grads, *a, da);
                }
                Op::Tanh(a) => {
                    let da = g.zip(&node.value, |gv, y| gv * (1.0 - y * y));
                    accumulate(&mut grads, *a, da);
                }
                Op::GuardedDiv(a, b, eps) => {
                    let (x, y) = (self.value(*a), self.value(*b));
                    let mut da = Matrix::zeros(x.rows, x.cols);
                    let mut db = Matrix::zeros(y.rows, y.cols);
                    for k in 0..g.len() {
                        let d = y.data[k];
                        if d.abs() > *eps {
                            da.data[k] = g.data[k] / d;
                            db.data[k] = -g.data[k] * x.data[k] / (d * d);
                        }
                    }
                    accumulate(&mut grads, *a, da);
                    accumulate(&mut grads, *b, db);
                }
                Op::SelectCols(a, idx) => {
                    let x = self.value(*a);
                    let mut da = Matrix::zeros(x.rows, x.cols);
                    for r in 0..g.rows {
                        for (j, &src) in idx.iter().enumerate() {
                            da.data[r * x.cols + src] += g.data[r * g.cols + j];
                        }
                    }
                    accumulate(&mut grads, *a, da);
                }
                Op::Sum(a) => {
                    let x = self.value(*a);
                    let da = Matrix::from_vec(x.rows, x.cols, vec![g.item(); x.len()]);
                    accumulate(&mut grads, *a, da);
                }
                Op::Mean(a) => {
                    let x = self.value(*a);
                    if !x.is_empty() {
                        let v = g.item() / x.len() as f64;
                        accumulate(&mut grads, *a, Matrix::from_vec(x.rows, x.cols, vec![v; x.len()]));
                    }
                }
            }
        }

        Gradients { grads }
    }
}

fn accumulate(grads: &mut [Option<Matrix>], v: Var, g: Matrix) {
    match &mut grads[v.0] {
        Some(existing) => existing.add_assign(&g),
        slot @ None => *slot = Some(g),
    }
}

/// `backward` の結果
pub struct Gradients {
    grads: Vec<Option<Matrix>>,
}

impl Gradients {
    /// ルートに寄与しないノードは `None`
    pub fn get(&self, v: Var) -> Option<&Matrix> {
        self.grads.get(v.0).and_then(Option::as_ref)
    }
}
