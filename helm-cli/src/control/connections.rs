use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use helm_broker::{ExchangeCredentials, ExchangeGateway};
use helm_core::{
    mask_api_key, CommandError, CommandResultData, ConnectionChange, ConnectionEvent,
    EventPayload, ExchangeConnection, LinkStatus, Params, PRIMARY_VENUE,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::params::{data, to_json, CONNECTION_ID};
use super::{CommandHandler, CommandName, ControlContext};

/// Exchange connection lifecycle: connect through a registered connector, probe, and
/// disconnect.
pub struct ConnectionCommands {
    ctx: Arc<ControlContext>,
}

impl ConnectionCommands {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    fn publish(&self, change: ConnectionChange, connection: ExchangeConnection) {
        self.ctx
            .bus
            .publish(EventPayload::Connection(ConnectionEvent { change, connection }));
    }

    /// Stored metadata, or a minimal record for gateways registered without one.
    fn metadata(&self, id: &str, gateway: &Arc<dyn ExchangeGateway>) -> ExchangeConnection {
        self.ctx
            .state
            .connection(id)
            .unwrap_or_else(|| ExchangeConnection {
                id: id.to_string(),
                exchange: gateway.info().name,
                testnet: false,
                api_key_hint: String::new(),
                status: LinkStatus::Connected,
                created_at: Utc::now(),
                last_tested_at: None,
            })
    }

    async fn create(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let credentials = ExchangeCredentials {
            exchange: params.require_str(&["exchange"])?.to_lowercase(),
            api_key: params.require_str(&["api_key"])?,
            api_secret: params.require_str(&["api_secret"])?,
            passphrase: params.str_opt(&["passphrase"])?,
            testnet: params.bool_opt(&["testnet"])?.unwrap_or(false),
        };
        let factory = self.ctx.connectors.get(&credentials.exchange).ok_or_else(|| {
            CommandError::invalid(
                "exchange",
                format!(
                    "unsupported exchange '{}' (available: {})",
                    credentials.exchange,
                    self.ctx.connectors.names().join(", ")
                ),
            )
        })?;
        let gateway = self
            .ctx
            .call(
                &format!("connect to {}", credentials.exchange),
                factory.connect(&credentials, self.ctx.updates.clone()),
            )
            .await?;

        let id = self.ctx.venues.insert(gateway);
        let connection = ExchangeConnection {
            id: id.clone(),
            exchange: credentials.exchange.clone(),
            testnet: credentials.testnet,
            api_key_hint: mask_api_key(&credentials.api_key),
            status: LinkStatus::Connected,
            created_at: Utc::now(),
            last_tested_at: None,
        };
        info!(connection = %id, exchange = %credentials.exchange, testnet = credentials.testnet, "exchange connection created");
        self.publish(ConnectionChange::Created, connection.clone());
        Ok(data([
            ("id", Value::String(id)),
            ("connection", to_json(&connection)?),
        ]))
    }

    async fn delete(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let id = params.require_str(CONNECTION_ID)?;
        if id == PRIMARY_VENUE {
            return Err(CommandError::InvalidState(
                "The primary connection cannot be deleted".into(),
            ));
        }
        let gateway = self
            .ctx
            .venues
            .remove(&id)
            .ok_or_else(|| CommandError::NotFound(format!("Connection not found: {id}")))?;
        let connection = self.metadata(&id, &gateway);
        if let Err(err) = self.ctx.call("close connection", gateway.close()).await {
            warn!(connection = %id, error = %err, "gateway did not close cleanly");
        }
        info!(connection = %id, "exchange connection deleted");
        self.publish(ConnectionChange::Deleted, connection);
        Ok(data([("id", Value::String(id)), ("deleted", Value::Bool(true))]))
    }

    async fn test(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let id = params.require_str(CONNECTION_ID)?;
        let gateway = self
            .ctx
            .venues
            .get(&id)
            .ok_or_else(|| CommandError::NotFound(format!("Connection not found: {id}")))?;
        let (healthy, error) = match self.ctx.call("ping", gateway.ping()).await {
            Ok(healthy) => (healthy, None),
            Err(err) => (false, Some(err.to_string())),
        };
        let mut connection = self.metadata(&id, &gateway);
        connection.status = if healthy {
            LinkStatus::Healthy
        } else {
            LinkStatus::Failed
        };
        connection.last_tested_at = Some(Utc::now());
        info!(connection = %id, healthy, "exchange connection tested");
        self.publish(ConnectionChange::Tested, connection.clone());
        let mut result = data([
            ("healthy", Value::Bool(healthy)),
            ("connection", to_json(&connection)?),
        ]);
        if let Some(error) = error {
            result.insert("error_detail".into(), Value::String(error));
        }
        Ok(result)
    }

    async fn list(&self) -> Result<CommandResultData, CommandError> {
        let connections = self.ctx.state.connections();
        Ok(data([
            ("count", json!(connections.len())),
            ("connections", to_json(&connections)?),
        ]))
    }
}

#[async_trait]
impl CommandHandler for ConnectionCommands {
    fn commands(&self) -> &'static [CommandName] {
        &[
            CommandName::CreateConnection,
            CommandName::DeleteConnection,
            CommandName::TestConnection,
            CommandName::GetConnections,
        ]
    }

    async fn handle(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError> {
        match name {
            CommandName::CreateConnection => self.create(params).await,
            CommandName::DeleteConnection => self.delete(params).await,
            CommandName::TestConnection => self.test(params).await,
            CommandName::GetConnections => self.list().await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}
