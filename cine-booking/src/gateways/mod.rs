pub mod mock;
pub mod momo;
pub mod signing;
pub mod vnpay;

use cine_core::{CoreError, CoreResult, GatewayQuote, PaymentGateway, PaymentMethod};
use cine_pricing::round_to;
use std::collections::HashMap;
use std::sync::Arc;

pub use mock::MockGateway;
pub use momo::MomoGateway;
pub use vnpay::VnpayGateway;

/// Configured gateways by method
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.method(), gateway);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> CoreResult<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&method)
            .cloned()
            .ok_or_else(|| CoreError::ValidationError(format!("payment method {} is not enabled", method)))
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        self.gateways.keys().copied().collect()
    }
}

/// `round(amount / exchange_rate)` in whole gateway units.
pub fn quote(amount: f64, exchange_rate: f64) -> GatewayQuote {
    let rate = if exchange_rate > 0.0 { exchange_rate } else { 1.0 };
    GatewayQuote { amount: round_to(amount / rate, 0), exchange_rate: rate }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_converts_and_rounds() {
        assert_eq!(quote(240_000.0, 1.0).amount, 240_000.0);
        assert_eq!(quote(250_000.0, 24_000.0).amount, 10.0);
        assert_eq!(quote(100.0, 0.0).exchange_rate, 1.0);
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let registry = GatewayRegistry::new().with(Arc::new(MockGateway::new(PaymentMethod::Momo)));
        assert!(registry.get(PaymentMethod::Momo).is_ok());
        assert!(matches!(registry.get(PaymentMethod::Vnpay), Err(CoreError::ValidationError(_))));
    }
}
