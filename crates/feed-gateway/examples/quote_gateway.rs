//! 가상 시세 provider를 gateway로 감싸 호출하는 예제.
//!
//! ```bash
//! cargo run -p feed-gateway --example quote_gateway
//! FEED__STORE__URL=redis://localhost:6379 cargo run -p feed-gateway --example quote_gateway
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feed_core::{init_logging, LogConfig};
use feed_gateway::{FeedError, GatewayConfig, ProviderKey, ResilientGateway};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price: f64,
}

/// 세 번에 한 번 503을 돌려주는 가상 provider.
#[derive(Clone, Default)]
struct FlakyQuotes {
    requests: Arc<AtomicU32>,
}

impl FlakyQuotes {
    async fn fetch(self, symbol: &'static str) -> Result<Quote, FeedError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if n % 3 == 0 {
            return Err(FeedError::http(503, "upstream overloaded"));
        }
        Ok(Quote {
            symbol: symbol.to_string(),
            price: 180.0 + f64::from(n),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogConfig::from_env()).map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;

    let config = GatewayConfig::from_env()?;
    let gateway = ResilientGateway::connect(config).await?;
    let yahoo = ProviderKey::new("yahoo")?;
    let client = FlakyQuotes::default();

    for symbol in ["AAPL", "MSFT", "AAPL"] {
        let client = client.clone();
        let key = format!("quotes:{}", symbol);
        let result = gateway
            .call(&yahoo, &key, move || client.clone().fetch(symbol))
            .await;
        match result {
            Ok(quote) => info!(symbol = %quote.symbol, price = quote.price, "Quote received"),
            Err(e) => warn!(symbol, error = %e, retry_after = ?e.retry_after(), "Quote unavailable"),
        }
    }

    let metrics = gateway.get_metrics(&yahoo).await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
