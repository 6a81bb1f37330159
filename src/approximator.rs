use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{distributions::Uniform, Rng, SeedableRng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::actions::{ActionId, NUM_ACTIONS};
use crate::error::CheckpointError;
use crate::features::{StateVector, STATE_DIM};

pub type QValue = f64;
/// Vector of Q-values for a given state, indexed by action id.
pub type QVector = DVector<QValue>;

pub const HIDDEN_UNITS: usize = 64;
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;

/// Widths of the network, input first.
const LAYER_SIZES: [usize; 4] = [STATE_DIM, HIDDEN_UNITS, HIDDEN_UNITS, NUM_ACTIONS];

/// A trainable state -> per-action value function.
pub trait ValueApproximator: Send {
    /// Everything needed to resume training: parameters and optimizer state.
    type Snapshot: Serialize + DeserializeOwned;

    /// Side-effect-free inference.
    fn predict(&self, state: &StateVector) -> QVector;

    /// One gradient step on the squared error between the value predicted for
    /// `action` and `target`. Other actions' values are left out of the
    /// objective. Returns the loss before the update.
    fn train_step(&mut self, state: &StateVector, action: ActionId, target: QValue) -> f64;

    fn snapshot(&self) -> Self::Snapshot;

    /// Replaces the parameters with `snapshot`. On error nothing is modified.
    fn restore(&mut self, snapshot: Self::Snapshot) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `outputs x inputs`.
    pub weights: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl DenseLayer {
    /// Uniform in `[-1/sqrt(inputs), 1/sqrt(inputs)]`, as torch's `nn.Linear` does.
    fn random<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs as f64).sqrt();
        let unif = Uniform::new_inclusive(-bound, bound);
        Self {
            weights: DMatrix::from_fn(outputs, inputs, |_, _| rng.sample(unif)),
            bias: DVector::from_fn(outputs, |_, _| rng.sample(unif)),
        }
    }

    fn zeros_like(other: &DenseLayer) -> Self {
        Self {
            weights: DMatrix::zeros(other.weights.nrows(), other.weights.ncols()),
            bias: DVector::zeros(other.bias.len()),
        }
    }

    fn has_shape(&self, inputs: usize, outputs: usize) -> bool {
        self.weights.nrows() == outputs && self.weights.ncols() == inputs && self.bias.len() == outputs
    }
}

/// Adam moment estimates, one entry per layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub step: u64,
    pub first_moment: Vec<DenseLayer>,
    pub second_moment: Vec<DenseLayer>,
}

impl AdamState {
    fn new(learning_rate: f64, layers: &[DenseLayer]) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            first_moment: layers.iter().map(DenseLayer::zeros_like).collect(),
            second_moment: layers.iter().map(DenseLayer::zeros_like).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpSnapshot {
    pub layers: Vec<DenseLayer>,
    pub optimizer: AdamState,
}

/// Fully connected ReLU network `8 -> 64 -> 64 -> 5` trained with Adam.
#[derive(Debug, Clone)]
pub struct MlpApproximator {
    layers: Vec<DenseLayer>,
    optimizer: AdamState,
}

/// Intermediate values of a forward pass, kept for backpropagation.
struct ForwardPass {
    /// `activations[0]` is the input, the last entry the output.
    activations: Vec<DVector<f64>>,
    pre_activations: Vec<DVector<f64>>,
}

impl MlpApproximator {
    pub fn new<R: Rng>(learning_rate: f64, rng: &mut R) -> Self {
        let layers = LAYER_SIZES
            .windows(2)
            .map(|w| DenseLayer::random(w[0], w[1], &mut *rng))
            .collect::<Vec<_>>();
        let optimizer = AdamState::new(learning_rate, &layers);
        Self { layers, optimizer }
    }

    pub fn with_seed(learning_rate: f64, seed: u64) -> Self {
        Self::new(learning_rate, &mut StdRng::seed_from_u64(seed))
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.step
    }

    fn forward(&self, state: &StateVector) -> ForwardPass {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        activations.push(DVector::from_column_slice(state.as_slice()));

        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let z = &layer.weights * &activations[i] + &layer.bias;
            let a = if i == last {
                z.clone()
            } else {
                z.map(|x| x.max(0.0))
            };
            pre_activations.push(z);
            activations.push(a);
        }
        ForwardPass {
            activations,
            pre_activations,
        }
    }

    fn check_shapes(layers: &[DenseLayer]) -> Result<(), CheckpointError> {
        let expected = LAYER_SIZES.len() - 1;
        if layers.len() != expected {
            return Err(CheckpointError::Shape(format!(
                "expected {} layers, found {}",
                expected,
                layers.len()
            )));
        }
        for (i, (layer, w)) in layers.iter().zip(LAYER_SIZES.windows(2)).enumerate() {
            if !layer.has_shape(w[0], w[1]) {
                return Err(CheckpointError::Shape(format!(
                    "layer {} is {}x{} (bias {}), expected {}x{}",
                    i,
                    layer.weights.nrows(),
                    layer.weights.ncols(),
                    layer.bias.len(),
                    w[1],
                    w[0]
                )));
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_update(
    params: &mut [f64],
    grads: &[f64],
    m: &mut [f64],
    v: &mut [f64],
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    bias_correction1: f64,
    bias_correction2: f64,
) {
    for (((p, g), m), v) in params.iter_mut().zip(grads).zip(m.iter_mut()).zip(v.iter_mut()) {
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;
        let m_hat = *m / bias_correction1;
        let v_hat = *v / bias_correction2;
        *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
    }
}

impl ValueApproximator for MlpApproximator {
    type Snapshot = MlpSnapshot;

    fn predict(&self, state: &StateVector) -> QVector {
        let mut pass = self.forward(state);
        pass.activations.pop().unwrap_or_else(|| QVector::zeros(NUM_ACTIONS))
    }

    fn train_step(&mut self, state: &StateVector, action: ActionId, target: QValue) -> f64 {
        assert!(action < NUM_ACTIONS, "action {} out of range", action);
        let pass = self.forward(state);
        let last = self.layers.len() - 1;
        let q = &pass.activations[last + 1];

        // Mean squared error over the output vector, where every coordinate
        // but `action` is its own target and contributes nothing.
        let err = q[action] - target;
        let loss = err * err / NUM_ACTIONS as f64;
        let mut delta = DVector::zeros(NUM_ACTIONS);
        delta[action] = 2.0 * err / NUM_ACTIONS as f64;

        let mut grads = Vec::with_capacity(self.layers.len());
        for i in (0..=last).rev() {
            let grad_w = &delta * pass.activations[i].transpose();
            let grad_b = delta.clone();
            if i > 0 {
                let mut back = self.layers[i].weights.transpose() * &delta;
                for (b, z) in back.iter_mut().zip(pass.pre_activations[i - 1].iter()) {
                    if *z <= 0.0 {
                        *b = 0.0;
                    }
                }
                delta = back;
            }
            grads.push(DenseLayer {
                weights: grad_w,
                bias: grad_b,
            });
        }
        grads.reverse();

        let opt = &mut self.optimizer;
        opt.step += 1;
        let bias_correction1 = 1.0 - opt.beta1.powi(opt.step as i32);
        let bias_correction2 = 1.0 - opt.beta2.powi(opt.step as i32);
        for (((layer, grad), m), v) in self
            .layers
            .iter_mut()
            .zip(&grads)
            .zip(opt.first_moment.iter_mut())
            .zip(opt.second_moment.iter_mut())
        {
            adam_update(
                layer.weights.as_mut_slice(),
                grad.weights.as_slice(),
                m.weights.as_mut_slice(),
                v.weights.as_mut_slice(),
                opt.learning_rate,
                opt.beta1,
                opt.beta2,
                opt.epsilon,
                bias_correction1,
                bias_correction2,
            );
            adam_update(
                layer.bias.as_mut_slice(),
                grad.bias.as_slice(),
                m.bias.as_mut_slice(),
                v.bias.as_mut_slice(),
                opt.learning_rate,
                opt.beta1,
                opt.beta2,
                opt.epsilon,
                bias_correction1,
                bias_correction2,
            );
        }
        loss
    }

    fn snapshot(&self) -> MlpSnapshot {
        MlpSnapshot {
            layers: self.layers.clone(),
            optimizer: self.optimizer.clone(),
        }
    }

    fn restore(&mut self, snapshot: MlpSnapshot) -> Result<(), CheckpointError> {
        Self::check_shapes(&snapshot.layers)?;
        Self::check_shapes(&snapshot.optimizer.first_moment)?;
        Self::check_shapes(&snapshot.optimizer.second_moment)?;
        self.layers = snapshot.layers;
        self.optimizer = snapshot.optimizer;
        Ok(())
    }
}
