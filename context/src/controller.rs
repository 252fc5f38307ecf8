use std::sync::Arc;

use thiserror::Error;

use procvar_codec::{ByteCodec, CodecLimits, DecodingError, EncodingError, TypeRegistry};
use procvar_types::{FlushPolicy, SlotKey};

use crate::proxy::ProxyFactory;
use crate::store::{StoreError, VariableStore};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("couldn't deserialize variable {slot}")]
    Decode {
        slot: SlotKey,
        #[source]
        source: DecodingError,
    },
    #[error("couldn't serialize variable {slot}")]
    Encode {
        slot: SlotKey,
        #[source]
        source: EncodingError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VariableError {
    #[must_use]
    pub fn slot(&self) -> &SlotKey {
        match self {
            Self::Decode { slot, .. }
            | Self::Encode { slot, .. }
            | Self::Store(StoreError::NotFound(slot) | StoreError::Backend { slot, .. }) => slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Hand out change-tracking proxies for composite values.
    pub proxying: bool,
    pub flush_policy: FlushPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            proxying: true,
            flush_policy: FlushPolicy::CompareAll,
        }
    }
}

/// Process-wide entry point: owns the codec and proxy factory and opens
/// units of work against a store.
#[derive(Debug, Clone)]
pub struct VariableController {
    codec: ByteCodec,
    proxies: ProxyFactory,
    options: ControllerOptions,
}

impl VariableController {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            codec: ByteCodec::new(Arc::clone(&registry)),
            proxies: ProxyFactory::new(registry),
            options: ControllerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.codec = self.codec.with_limits(limits);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.proxies = self.proxies.enabled(options.proxying);
        self.options = options;
        self
    }

    #[must_use]
    pub fn codec(&self) -> &ByteCodec {
        &self.codec
    }

    #[must_use]
    pub fn proxies(&self) -> &ProxyFactory {
        &self.proxies
    }

    #[must_use]
    pub fn options(&self) -> ControllerOptions {
        self.options
    }

    /// Start a unit of work. Nothing is cached across units: every unit
    /// decodes from storage again.
    pub fn begin<'a, S: VariableStore + ?Sized>(&'a self, store: &'a mut S) -> UnitOfWork<'a, S> {
        UnitOfWork::new(self, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_toggle_proxying() {
        let controller = VariableController::new(Arc::new(TypeRegistry::new()));
        assert!(controller.proxies().is_enabled());

        let controller = controller.with_options(ControllerOptions {
            proxying: false,
            flush_policy: FlushPolicy::TouchedOnly,
        });
        assert!(!controller.proxies().is_enabled());
        assert_eq!(controller.options().flush_policy, FlushPolicy::TouchedOnly);
    }

    #[test]
    fn limits_reach_the_codec() {
        let controller = VariableController::new(Arc::new(TypeRegistry::new()))
            .with_limits(CodecLimits { max_depth: 4 });
        assert_eq!(controller.codec().limits().max_depth, 4);
    }

    #[test]
    fn error_reports_slot() {
        let err = VariableError::from(StoreError::NotFound(SlotKey::new("amount")));
        assert_eq!(err.slot().as_str(), "amount");
        assert_eq!(err.to_string(), "no stored value for variable amount");
    }
}
