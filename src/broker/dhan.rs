// =============================================================================
// DhanHQ REST gateway — access-token authenticated v2 endpoints
// =============================================================================
//
// SECURITY: the access token is sent only as a header and is never logged or
// serialised. Every call carries the client's 10 s timeout; a timeout maps
// to `BrokerError::Timeout` so callers never retry inline.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::types::{Segment, TransactionType};

use super::{
    BrokerError, BrokerGateway, BrokerPosition, ExitAck, MarketOrderRequest, OrderAck,
    WalletSnapshot,
};

/// Default base URL of the DhanHQ v2 REST API.
const DEFAULT_BASE_URL: &str = "https://api.dhan.co/v2";

/// DhanHQ REST client implementing [`BrokerGateway`].
#[derive(Clone)]
pub struct DhanGateway {
    client_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl DhanGateway {
    /// Create a gateway. The `access_token` is installed as a default header
    /// so it never appears in query strings.
    pub fn new(client_id: impl Into<String>, access_token: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(access_token) {
            headers.insert("access-token", val);
        }
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client_id: client_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http,
        }
    }

    /// Override the base URL (tests point this at a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn map_err(e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout
        } else {
            BrokerError::Http(e.to_string())
        }
    }

    /// POST a JSON body and return the parsed response, mapping non-2xx to
    /// `BrokerError::Api`.
    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: value.to_string(),
            });
        }
        Ok(value)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await.map_err(Self::map_err)?;

        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: value.to_string(),
            });
        }
        Ok(value)
    }

    fn order_body(&self, request: &MarketOrderRequest) -> serde_json::Value {
        json!({
            "dhanClientId": self.client_id,
            "correlationId": request.client_order_id,
            "transactionType": match request.transaction_type {
                TransactionType::Buy => "BUY",
                TransactionType::Sell => "SELL",
            },
            "exchangeSegment": request.segment.as_str(),
            "productType": "INTRADAY",
            "orderType": "MARKET",
            "validity": "DAY",
            "securityId": request.security_id,
            "quantity": request.quantity,
        })
    }
}

#[async_trait]
impl BrokerGateway for DhanGateway {
    #[instrument(skip(self, request), name = "dhan::place_market", fields(sid = %request.security_id))]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<OrderAck, BrokerError> {
        let body = self.order_body(request);
        let value = self.post_json("/orders", body).await?;

        let order_id = value["orderId"]
            .as_str()
            .map(str::to_string)
            .or_else(|| value["orderId"].as_u64().map(|n| n.to_string()))
            .ok_or_else(|| BrokerError::InvalidResponse("missing orderId".to_string()))?;

        let status = value["orderStatus"].as_str().unwrap_or("");
        if status == "REJECTED" {
            return Err(BrokerError::Rejected(
                value["omsErrorDescription"]
                    .as_str()
                    .unwrap_or("rejected")
                    .to_string(),
            ));
        }

        debug!(order_id = %order_id, "market order placed");
        Ok(OrderAck { order_id })
    }

    #[instrument(skip(self), name = "dhan::flat_position")]
    async fn flat_position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<ExitAck, BrokerError> {
        // Dhan has no single flatten endpoint: read the net position and
        // place the opposite market order for its quantity.
        let position = self.position(segment, security_id).await?.ok_or_else(|| {
            BrokerError::InvalidResponse(format!("no open position for {security_id}"))
        })?;

        if position.qty <= 0 {
            return Err(BrokerError::InvalidResponse(format!(
                "non-positive net quantity {} for {security_id}",
                position.qty
            )));
        }

        let body = json!({
            "dhanClientId": self.client_id,
            "transactionType": "SELL",
            "exchangeSegment": segment.as_str(),
            "productType": "INTRADAY",
            "orderType": "MARKET",
            "validity": "DAY",
            "securityId": security_id,
            "quantity": position.qty,
        });
        let value = self.post_json("/orders", body).await?;

        let order_id = value["orderId"]
            .as_str()
            .map(str::to_string)
            .or_else(|| value["orderId"].as_u64().map(|n| n.to_string()))
            .ok_or_else(|| BrokerError::InvalidResponse("missing orderId".to_string()))?;

        // The fill price arrives later on the order-update stream.
        Ok(ExitAck { order_id, exit_price: None })
    }

    #[instrument(skip(self), name = "dhan::position")]
    async fn position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<Option<BrokerPosition>, BrokerError> {
        let value = self.get_json("/positions").await?;
        let rows = value
            .as_array()
            .ok_or_else(|| BrokerError::InvalidResponse("positions not an array".to_string()))?;

        for row in rows {
            let sid = row["securityId"].as_str().unwrap_or("");
            let seg = row["exchangeSegment"].as_str().unwrap_or("");
            if sid == security_id && seg == segment.as_str() {
                let net_qty = row["netQty"].as_i64().unwrap_or(0);
                return Ok(Some(BrokerPosition {
                    qty: net_qty,
                    avg_price: row["buyAvg"].as_f64().unwrap_or(0.0),
                    upnl: row["unrealizedProfit"].as_f64().unwrap_or(0.0),
                    rpnl: row["realizedProfit"].as_f64().unwrap_or(0.0),
                    last_ltp: row["lastTradedPrice"].as_f64().unwrap_or(0.0),
                }));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self), name = "dhan::wallet_snapshot")]
    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, BrokerError> {
        let value = self.get_json("/fundlimit").await?;
        Ok(WalletSnapshot {
            cash: value["availabelBalance"]
                .as_f64()
                .or_else(|| value["availableBalance"].as_f64())
                .unwrap_or(0.0),
            equity: value["sodLimit"].as_f64().unwrap_or(0.0),
            mtm: value["utilizedAmount"].as_f64().unwrap_or(0.0),
            exposure: value["collateralAmount"].as_f64().unwrap_or(0.0),
        })
    }

    #[instrument(skip(self, request), name = "dhan::ltp_batch")]
    async fn ltp_batch(
        &self,
        request: &HashMap<Segment, Vec<String>>,
    ) -> Result<HashMap<Segment, HashMap<String, f64>>, BrokerError> {
        let mut body = serde_json::Map::new();
        for (segment, sids) in request {
            let ids: Vec<serde_json::Value> = sids
                .iter()
                .filter_map(|sid| sid.parse::<i64>().ok().map(serde_json::Value::from))
                .collect();
            body.insert(segment.as_str().to_string(), serde_json::Value::Array(ids));
        }

        let value = self
            .post_json("/marketfeed/ltp", serde_json::Value::Object(body))
            .await?;

        let mut out: HashMap<Segment, HashMap<String, f64>> = HashMap::new();
        let data = &value["data"];
        for (segment, sids) in request {
            let seg_block = &data[segment.as_str()];
            let mut prices = HashMap::new();
            for sid in sids {
                if let Some(ltp) = seg_block[sid]["last_price"].as_f64() {
                    prices.insert(sid.clone(), ltp);
                }
            }
            if !prices.is_empty() {
                out.insert(*segment, prices);
            }
        }

        if out.is_empty() && !request.is_empty() {
            warn!("ltp_batch returned no prices for any requested instrument");
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "dhan::amend_protective_stop")]
    async fn amend_protective_stop(
        &self,
        _segment: Segment,
        _security_id: &str,
        order_no: &str,
        trigger_price: f64,
    ) -> Result<(), BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, order_no);
        let body = json!({
            "dhanClientId": self.client_id,
            "orderId": order_no,
            "orderType": "STOP_LOSS_MARKET",
            "triggerPrice": trigger_price,
            "validity": "DAY",
        });

        let resp = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!(order_no, trigger_price, "protective stop amended");
        Ok(())
    }
}

impl std::fmt::Debug for DhanGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhanGateway")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
