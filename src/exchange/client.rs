//! Binance REST API client.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument};

use super::traits::ExchangeApi;
use super::types::*;
use crate::config::ExchangeConfig;
use crate::model::WalletType;

const BASE_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Binance API client covering the spot and cross-margin wallets.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if config.testnet {
            TESTNET_URL.to_string()
        } else {
            BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Self::timestamp()));
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        Self::decode(path, response).await
    }

    async fn signed_post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        Self::decode(path, response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{path} returned {status}: {body}"));
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response"))
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    #[instrument(skip(self))]
    async fn fetch_markets(&self) -> Result<Vec<Market>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch exchange info")?;
        let info: ExchangeInfoResponse = Self::decode("/api/v3/exchangeInfo", response).await?;

        let mut markets: Vec<Market> = info
            .symbols
            .into_iter()
            .map(SymbolInfo::into_market)
            .collect();

        // Cross-margin availability lives on a separate endpoint.
        let url = format!("{}/sapi/v1/margin/allPairs", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("Failed to fetch margin pairs")?;
        let pairs: Vec<MarginPair> = Self::decode("/sapi/v1/margin/allPairs", response).await?;
        let margin_symbols: std::collections::HashSet<String> = pairs
            .into_iter()
            .filter(|p| p.is_margin_trade)
            .map(|p| p.symbol)
            .collect();

        for market in &mut markets {
            market.margin = margin_symbols.contains(&market.symbol);
        }

        debug!(count = markets.len(), "Loaded markets");
        Ok(markets)
    }

    #[instrument(skip(self))]
    async fn fetch_prices(&self) -> Result<HashMap<String, Decimal>> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch prices")?;
        let tickers: Vec<PriceTicker> = Self::decode("/api/v3/ticker/price", response).await?;
        Ok(tickers.into_iter().map(|t| (t.symbol, t.price)).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let url = format!(
            "{}/api/v3/ticker/bookTicker?symbol={}",
            self.base_url, symbol
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch book ticker")?;
        let book: BookTicker = Self::decode("/api/v3/ticker/bookTicker", response).await?;
        Ok(Ticker {
            bid: book.bid_price,
            ask: book.ask_price,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_balances(&self, wallet: WalletType) -> Result<WalletBalances> {
        let assets = match wallet {
            WalletType::Spot => {
                let account: SpotAccountResponse =
                    self.signed_get("/api/v3/account", &[]).await?;
                account
                    .balances
                    .into_iter()
                    .map(|b| {
                        (
                            b.asset,
                            AssetBalance {
                                free: b.free,
                                locked: b.locked,
                                borrowed: Decimal::ZERO,
                                interest: Decimal::ZERO,
                            },
                        )
                    })
                    .collect()
            }
            WalletType::Margin => {
                let account: MarginAccountResponse =
                    self.signed_get("/sapi/v1/margin/account", &[]).await?;
                account
                    .user_assets
                    .into_iter()
                    .map(|b| {
                        (
                            b.asset,
                            AssetBalance {
                                free: b.free,
                                locked: b.locked,
                                borrowed: b.borrowed,
                                interest: b.interest,
                            },
                        )
                    })
                    .collect()
            }
        };

        Ok(WalletBalances {
            wallet,
            assets,
            fetched_at: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        wallet: WalletType,
    ) -> Result<OrderResult> {
        let path = match wallet {
            WalletType::Spot => "/api/v3/order",
            WalletType::Margin => "/sapi/v1/margin/order",
        };
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        let response: OrderResponse = self.signed_post(path, &params).await?;
        Ok(response.into_result())
    }

    #[instrument(skip(self))]
    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<u64> {
        let params = [
            ("asset", asset.to_string()),
            ("amount", amount.to_string()),
        ];
        let response: MarginTransactionResponse =
            self.signed_post("/sapi/v1/margin/loan", &params).await?;
        Ok(response.tran_id)
    }

    #[instrument(skip(self))]
    async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<u64> {
        let params = [
            ("asset", asset.to_string()),
            ("amount", amount.to_string()),
        ];
        let response: MarginTransactionResponse =
            self.signed_post("/sapi/v1/margin/repay", &params).await?;
        Ok(response.tran_id)
    }
}
