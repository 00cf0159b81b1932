//! HTTP client for a terminal bridge exposing the broker as a small REST API.
//!
//! Endpoints (all JSON, bearer token auth):
//! - `GET /bars?symbol=&timeframe=&count=`
//! - `GET /account`
//! - `GET /positions?symbol=`
//! - `POST /orders`
//! - `PUT /positions/{ticket}/sl`
//! - `DELETE /positions/{ticket}`
//! - `GET /symbols/{symbol}`

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::*;
use super::BrokerGateway;
use crate::error::BrokerError;
use crate::models::{CloseResult, OrderFill, OrderRequest, Position, PriceBar, SymbolMeta, Timeframe};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const ORDER_COMMENT: &str = "rsi_trader";

/// Broker reached through the HTTP bridge.
pub struct RestBroker {
    client: Client,
    base_url: String,
    token: Option<String>,
    magic_number: u64,
}

impl RestBroker {
    pub fn new(base_url: impl Into<String>, token: Option<String>, magic_number: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            magic_number,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BrokerError> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BrokerError> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))
    }

    /// Map a 404 on a position endpoint to an unknown ticket.
    async fn send_for_ticket(&self, ticket: u64, request: RequestBuilder) -> Result<Response, BrokerError> {
        match self.send(request).await {
            Err(BrokerError::Rejected { code, .. }) if code == i64::from(StatusCode::NOT_FOUND.as_u16()) => {
                Err(BrokerError::UnknownPosition(ticket))
            }
            other => other,
        }
    }
}

/// Gateway statuses mean the bridge is up but the terminal behind it is not.
fn status_error(status: StatusCode, body: String) -> BrokerError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            BrokerError::Connection(format!("{} - {}", status, body))
        }
        _ => {
            let error = serde_json::from_str::<ErrorResponse>(&body).unwrap_or(ErrorResponse {
                code: i64::from(status.as_u16()),
                message: body,
            });
            BrokerError::rejected(error.code, format!("{} - {}", status, error.message))
        }
    }
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout
    } else if e.is_decode() {
        BrokerError::Protocol(e.to_string())
    } else {
        BrokerError::Connection(e.to_string())
    }
}

#[async_trait]
impl BrokerGateway for RestBroker {
    async fn get_recent_bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<PriceBar>, BrokerError> {
        let url = self.url("/bars");
        debug!(url = %url, symbol, timeframe = %timeframe, count, "Fetching bars");

        let request = self.client.get(&url).query(&[
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.as_str().to_string()),
            ("count", count.to_string()),
        ]);
        let raw: Vec<BarResponse> = self.fetch(request).await?;

        raw.into_iter()
            .map(|b| {
                let time = b.time;
                b.into_bar()
                    .ok_or_else(|| BrokerError::Protocol(format!("invalid bar time {}", time)))
            })
            .collect()
    }

    async fn get_account_balance(&self) -> Result<Decimal, BrokerError> {
        let account: AccountResponse = self.fetch(self.client.get(self.url("/account"))).await?;
        Ok(account.balance)
    }

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        let request = self.client.get(self.url("/positions")).query(&[("symbol", symbol)]);
        let raw: Vec<PositionResponse> = self.fetch(request).await?;

        raw.into_iter()
            .map(|p| {
                let ticket = p.ticket;
                p.into_position()
                    .ok_or_else(|| BrokerError::Protocol(format!("invalid open time for ticket {}", ticket)))
            })
            .collect()
    }

    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderFill, BrokerError> {
        let body = OrderBody {
            symbol: order.symbol,
            side: order.side,
            volume: order.volume,
            sl: order.stop_loss,
            magic: self.magic_number,
            client_order_id: Uuid::new_v4().to_string(),
            comment: ORDER_COMMENT.to_string(),
        };

        info!(
            client_order_id = %body.client_order_id,
            symbol = %body.symbol,
            side = %body.side,
            volume = %body.volume,
            "Submitting order"
        );

        let fill: OrderResponse = self.fetch(self.client.post(self.url("/orders")).json(&body)).await?;
        let open_time = chrono::DateTime::from_timestamp(fill.time, 0)
            .ok_or_else(|| BrokerError::Protocol(format!("invalid fill time {}", fill.time)))?;

        Ok(OrderFill {
            ticket: fill.ticket,
            fill_price: fill.price,
            open_time,
        })
    }

    async fn modify_stop_loss(&mut self, ticket: u64, stop_loss: Decimal) -> Result<(), BrokerError> {
        let request = self
            .client
            .put(self.url(&format!("/positions/{}/sl", ticket)))
            .json(&StopLossBody { sl: stop_loss });
        self.send_for_ticket(ticket, request).await?;
        Ok(())
    }

    async fn close_position(&mut self, ticket: u64) -> Result<CloseResult, BrokerError> {
        let request = self.client.delete(self.url(&format!("/positions/{}", ticket)));
        let response = self.send_for_ticket(ticket, request).await?;
        let closed: CloseResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;

        Ok(CloseResult {
            close_price: closed.price,
            realized_pnl: closed.profit,
        })
    }

    async fn get_symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, BrokerError> {
        let raw: SymbolResponse = self
            .fetch(self.client.get(self.url(&format!("/symbols/{}", symbol))))
            .await?;
        Ok(raw.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_statuses_are_transient() {
        for status in [StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE, StatusCode::GATEWAY_TIMEOUT] {
            let error = status_error(status, "terminal disconnected".to_string());
            assert!(matches!(error, BrokerError::Connection(_)));
            assert!(error.is_transient());
        }
    }

    #[test]
    fn test_bridge_error_body_becomes_rejection() {
        let body = r#"{"code": 10016, "message": "Invalid stops"}"#.to_string();
        let error = status_error(StatusCode::BAD_REQUEST, body);
        assert!(matches!(error, BrokerError::Rejected { code: 10016, .. }));
        assert!(!error.is_transient());
    }

    #[test]
    fn test_plain_body_keeps_http_status_code() {
        let error = status_error(StatusCode::NOT_FOUND, "no such ticket".to_string());
        match error {
            BrokerError::Rejected { code, message } => {
                assert_eq!(code, 404);
                assert!(message.contains("no such ticket"));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let broker = RestBroker::new("http://localhost:8080/", None, 7).unwrap();
        assert_eq!(broker.url("/bars"), "http://localhost:8080/bars");
    }
}
