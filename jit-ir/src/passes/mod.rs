//! Optimization passes over the IR graph.
//!
//! Passes are deterministic and purely in-memory; each rewrites the
//! builder in place. The runner applies them in registration order.

pub mod dead_code_elimination;
pub mod load_store_elimination;
pub mod register_allocation;

pub use dead_code_elimination::DeadCodeEliminationPass;
pub use load_store_elimination::LoadStoreEliminationPass;
pub use register_allocation::{RegisterAllocationPass, RegisterDef};

use crate::builder::IrBuilder;

/// A single transforming pass.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&mut self, ir: &mut IrBuilder);
}

/// Ordered pass pipeline.
pub struct PassRunner {
    passes: Vec<Box<dyn Pass>>,
}

impl PassRunner {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&mut self, ir: &mut IrBuilder) {
        for pass in &mut self.passes {
            log::trace!("running pass {}", pass.name());
            pass.run(ir);
        }
    }
}

impl Default for PassRunner {
    fn default() -> Self {
        Self::new()
    }
}
