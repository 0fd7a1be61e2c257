//! Hand-off of meta-tagged products to downstream consumers.

use std::sync::{Mutex, PoisonError};

use crate::core::MetaTarget;
use crate::recipe::Product;

/// Receives every successful product of a meta-tagged task once the run
/// settles. Archival and QC systems hook in here.
pub trait Delivery: Send + Sync {
    fn deliver(&self, product: &Product, targets: &[MetaTarget]) -> anyhow::Result<()>;
}

/// Logs each delivered product and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

impl Delivery for LogDelivery {
    fn deliver(&self, product: &Product, targets: &[MetaTarget]) -> anyhow::Result<()> {
        let targets: Vec<_> = targets.iter().map(MetaTarget::as_str).collect();
        tracing::info!(
            "delivering {} ({} files) to {}",
            product.instance,
            product.files.len(),
            targets.join(", ")
        );
        Ok(())
    }
}

/// Keeps every delivered product in memory.
#[derive(Debug, Default)]
pub struct CollectDelivery {
    delivered: Mutex<Vec<(Product, Vec<MetaTarget>)>>,
}

impl CollectDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Products delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<(Product, Vec<MetaTarget>)> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Delivery for CollectDelivery {
    fn deliver(&self, product: &Product, targets: &[MetaTarget]) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((product.clone(), targets.to_vec()));
        Ok(())
    }
}
