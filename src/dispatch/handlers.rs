use std::sync::Arc;

use serde_json::json;

use crate::dispatch::{Handler, HandlerError};
use crate::events::Event;
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::delivery::Router;
use crate::orchestrator::triggers::TriggerSet;

const LOG_CONTEXT: &str = "ingest::handlers";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Log,
    Triggers,
}

impl HandlerKind {
    pub const ALLOWED_VALUES: &'static str = "log, triggers";

    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Some(Self::Log),
            "triggers" => Some(Self::Triggers),
            _ => None,
        }
    }
}

/// Builds handlers in configuration order.
pub fn build_handlers(
    kinds: &[HandlerKind],
    triggers: &TriggerSet,
    router: &Arc<Router>,
    logger: &Arc<Logger>,
) -> Vec<Arc<dyn Handler>> {
    kinds
        .iter()
        .map(|kind| -> Arc<dyn Handler> {
            match kind {
                HandlerKind::Log => Arc::new(LogHandler::new(Arc::clone(logger))),
                HandlerKind::Triggers => Arc::new(TriggerHandler::new(
                    triggers.clone(),
                    Arc::clone(router),
                    Arc::clone(logger),
                )),
            }
        })
        .collect()
}

/// Writes every received event to the log.
pub struct LogHandler {
    logger: Arc<Logger>,
}

impl LogHandler {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            &format!(
                "Received event {}#{}",
                event.connection_id(),
                event.sequence()
            ),
            Some(event.log_payload()),
        );
        Ok(())
    }
}

/// Matches hotcue events against configured triggers and routes their actions.
///
/// Local application actions are logged as routed. Network actions are sent
/// per destination app, one message per matched trigger; any failed delivery
/// fails the handler once every destination was attempted.
pub struct TriggerHandler {
    triggers: TriggerSet,
    router: Arc<Router>,
    logger: Arc<Logger>,
}

impl TriggerHandler {
    pub fn new(triggers: TriggerSet, router: Arc<Router>, logger: Arc<Logger>) -> Self {
        Self {
            triggers,
            router,
            logger,
        }
    }
}

impl Handler for TriggerHandler {
    fn name(&self) -> &str {
        "triggers"
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if self.triggers.is_empty() {
            return Ok(());
        }

        let hotcue = match event.hotcue() {
            Ok(hotcue) => hotcue,
            Err(error) => {
                self.logger.verbose(
                    Some(LOG_CONTEXT),
                    &format!(
                        "event {}#{} is not a hotcue event, skipping triggers: {error}",
                        event.connection_id(),
                        event.sequence()
                    ),
                );
                return Ok(());
            }
        };

        let mut failed_deliveries = Vec::new();
        for routed in self.triggers.route(&hotcue) {
            for action in &routed.local {
                self.logger.log(
                    LogLevel::Info,
                    Some(LOG_CONTEXT),
                    &format!(
                        "Routing action {} to {} for {hotcue}",
                        action.action_type, action.app_id
                    ),
                    Some(json!({
                        "trigger": routed.trigger.name,
                        "connection_id": event.connection_id(),
                        "sequence": event.sequence(),
                        "args": action.args,
                    })),
                );
            }
            for (app_id, actions) in &routed.network {
                match self
                    .router
                    .send_actions(app_id, &routed.trigger.name, actions)
                {
                    Ok(protocol) => self.logger.log(
                        LogLevel::Info,
                        Some(LOG_CONTEXT),
                        &format!(
                            "Delivered {} action(s) to {app_id} over {} for {hotcue}",
                            actions.len(),
                            protocol.as_str()
                        ),
                        Some(json!({
                            "trigger": routed.trigger.name,
                            "connection_id": event.connection_id(),
                            "sequence": event.sequence(),
                        })),
                    ),
                    Err(error) => failed_deliveries.push(format!("{app_id}: {error}")),
                }
            }
        }

        if failed_deliveries.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::failed(format!(
                "action delivery failed for {}",
                failed_deliveries.join("; ")
            )))
        }
    }
}
