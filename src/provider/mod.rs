//! Provider Facade (spec.md §4.3): a uniform trait over option-chain data
//! sources, with rate limiting and graceful-degradation fallback built
//! around it, mirroring the backend's one-struct-per-source /
//! one-facade-consumer pattern in `scrapers/mod.rs`.

pub mod dummy;
pub mod rate_limit;

use crate::domain::{ExpiryRule, Instrument, Quote};
use crate::error::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Real,
    Composite,
    Fallback,
}

impl ProviderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderMode::Real => "real",
            ProviderMode::Composite => "composite",
            ProviderMode::Fallback => "fallback",
        }
    }
}

/// Sets `g6_provider_mode{mode}` so exactly the active mode reads 1 and the
/// others read 0 (spec.md §4.3 "provider mode gauge").
pub fn publish_provider_mode(metrics: &crate::metrics::Registry, mode: ProviderMode) {
    for m in [ProviderMode::Real, ProviderMode::Composite, ProviderMode::Fallback] {
        let value = if m == mode { 1.0 } else { 0.0 };
        metrics.set("g6_provider_mode", &[("mode", m.as_str())], value);
    }
}

/// Uniform surface every data source implements (spec.md §4.3 operations).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn get_ltp(&self, symbol: &str) -> Result<f64, ProviderError>;

    async fn get_quote(&self, instrument: &str) -> Result<Quote, ProviderError>;

    async fn resolve_expiry(
        &self,
        symbol: &str,
        rule: &ExpiryRule,
    ) -> Result<NaiveDate, ProviderError>;

    async fn get_option_instruments(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError>;

    fn mode(&self) -> ProviderMode;
}

/// Wraps an inner `Provider` and synthesizes a quote from `GetLtp` when
/// `GetQuote` fails with `Missing` or `NoMethod` (spec.md §4.3 "graceful
/// degradation"). Bumps `g6_quote_fallback_total{path="synthesized"}` on the
/// synthetic path.
pub struct FallbackProvider<P: Provider> {
    inner: P,
    metrics: std::sync::Arc<crate::metrics::Registry>,
}

impl<P: Provider> FallbackProvider<P> {
    pub fn new(inner: P, metrics: std::sync::Arc<crate::metrics::Registry>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<P: Provider> Provider for FallbackProvider<P> {
    async fn get_ltp(&self, symbol: &str) -> Result<f64, ProviderError> {
        self.inner.get_ltp(symbol).await
    }

    async fn get_quote(&self, instrument: &str) -> Result<Quote, ProviderError> {
        match self.inner.get_quote(instrument).await {
            Ok(q) => Ok(q),
            Err(e) if matches!(e.kind, ProviderErrorKind::Missing | ProviderErrorKind::NoMethod) => {
                let ltp = self.inner.get_ltp(instrument).await?;
                self.metrics.inc("g6_quote_fallback_total", &[("path", "synthesized")], 1);
                Ok(Quote {
                    last_price: ltp,
                    volume: None,
                    oi: None,
                    bid: None,
                    ask: None,
                    iv: None,
                    greeks: None,
                    timestamp: chrono::Utc::now(),
                    quote_expiry: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_expiry(&self, symbol: &str, rule: &ExpiryRule) -> Result<NaiveDate, ProviderError> {
        self.inner.resolve_expiry(symbol, rule).await
    }

    async fn get_option_instruments(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError> {
        self.inner.get_option_instruments(symbol, expiry, strikes).await
    }

    fn mode(&self) -> ProviderMode {
        self.inner.mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Registry;
    use std::sync::Arc;

    struct MissingQuoteProvider;

    #[async_trait]
    impl Provider for MissingQuoteProvider {
        async fn get_ltp(&self, _symbol: &str) -> Result<f64, ProviderError> {
            Ok(123.45)
        }

        async fn get_quote(&self, _instrument: &str) -> Result<Quote, ProviderError> {
            Err(ProviderError::new(ProviderErrorKind::Missing))
        }

        async fn resolve_expiry(&self, _symbol: &str, _rule: &ExpiryRule) -> Result<NaiveDate, ProviderError> {
            Err(ProviderError::new(ProviderErrorKind::UnknownRule))
        }

        async fn get_option_instruments(
            &self,
            _symbol: &str,
            _expiry: NaiveDate,
            _strikes: &[f64],
        ) -> Result<Vec<Instrument>, ProviderError> {
            Ok(vec![])
        }

        fn mode(&self) -> ProviderMode {
            ProviderMode::Real
        }
    }

    #[tokio::test]
    async fn fallback_synthesizes_quote_from_ltp_on_missing() {
        let registry = Arc::new(Registry::new_for_test());
        let provider = FallbackProvider::new(MissingQuoteProvider, registry.clone());
        let quote = provider.get_quote("NIFTY25OCT20000CE").await.unwrap();
        assert_eq!(quote.last_price, 123.45);
        assert!(quote.volume.is_none());
    }
}
