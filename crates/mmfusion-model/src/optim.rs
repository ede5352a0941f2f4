//! Adam with inspectable moment state.
//!
//! Same update rule as `candle_nn::AdamW`, but variables are named and the
//! moments can be read back so they can be stored in a model artifact.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use mmfusion_core::{FusionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        }
    }
}

/// Scalar part of the optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerMeta {
    pub params: ParamsAdam,
    pub step: usize,
}

/// Snapshot of the optimizer: hyperparameters, step count and moments by
/// variable name.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub meta: OptimizerMeta,
    pub first_moments: HashMap<String, Tensor>,
    pub second_moments: HashMap<String, Tensor>,
}

#[derive(Debug)]
struct VarAdam {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

#[derive(Debug)]
pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    fn with_names(vars: Vec<(String, Var)>, params: ParamsAdam) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    /// Optimize every variable of `varmap`, named as in the map.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdam) -> Result<Self> {
        let mut named: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| FusionError::Training(format!("VarMap lock poisoned: {e}")))?;
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::with_names(named, params)?)
    }

    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Names of the optimized variables, sorted.
    pub fn var_names(&self) -> Vec<&str> {
        self.vars.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn state(&self) -> OptimizerState {
        let mut first_moments = HashMap::with_capacity(self.vars.len());
        let mut second_moments = HashMap::with_capacity(self.vars.len());
        for v in &self.vars {
            first_moments.insert(v.name.clone(), v.first_moment.as_tensor().clone());
            second_moments.insert(v.name.clone(), v.second_moment.as_tensor().clone());
        }
        OptimizerState {
            meta: OptimizerMeta {
                params: self.params,
                step: self.step_t,
            },
            first_moments,
            second_moments,
        }
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::with_names(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));

        for v in &self.vars {
            let theta = &v.var;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let next_m = ((v.first_moment.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((v.second_moment.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (theta.as_tensor() * (1f64 - lr * weight_decay))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (decayed - (adjusted * lr)?)?;
            v.first_moment.set(&next_m)?;
            v.second_moment.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }
}
