//! Escalation notification contract and its two implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::EscalationTemplate;
use crate::error::NotifyError;
use crate::models::EscalationEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub message_id: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Result<Delivery, NotifyError>> for NotifyOutcome {
    fn from(result: &Result<Delivery, NotifyError>) -> Self {
        match result {
            Ok(delivery) => NotifyOutcome {
                success: true,
                message_id: delivery.message_id.clone(),
                error: None,
            },
            Err(err) => NotifyOutcome {
                success: false,
                message_id: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EscalationEvent) -> Result<Delivery, NotifyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Sends the email and returns the provider message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, NotifyError>;
}

pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, NotifyError> {
        let message_id = Uuid::new_v4().to_string();
        info!(
            message_id = %message_id,
            to = %email.to.join(", "),
            subject = %email.subject,
            "escalation email dispatched"
        );
        Ok(message_id)
    }
}

pub fn render(template: &EscalationTemplate, event: &EscalationEvent) -> OutgoingEmail {
    let fill = |text: &str| {
        text.replace("{operator}", &event.operator_name)
            .replace("{count}", &event.defect_count.to_string())
            .replace("{previous}", &event.previous_count.to_string())
            .replace("{level}", &event.threshold_level.to_string())
            .replace("{defect_type}", event.defect_type.as_deref().unwrap_or("non précisé"))
            .replace("{timestamp}", &event.occurred_at.to_rfc3339())
    };
    OutgoingEmail {
        to: template.recipients.clone(),
        subject: fill(&template.subject),
        body: fill(&template.body),
    }
}

pub struct TemplateNotifier {
    levels: Vec<EscalationTemplate>,
    transport: Arc<dyn MailTransport>,
}

impl TemplateNotifier {
    pub fn new(levels: Vec<EscalationTemplate>, transport: Arc<dyn MailTransport>) -> Self {
        Self { levels, transport }
    }

    pub fn template(&self, threshold: u32) -> Option<&EscalationTemplate> {
        self.levels.iter().find(|level| level.threshold == threshold)
    }
}

#[async_trait]
impl Notifier for TemplateNotifier {
    async fn notify(&self, event: &EscalationEvent) -> Result<Delivery, NotifyError> {
        let template = self
            .template(event.threshold_level)
            .ok_or(NotifyError::MissingTemplate(event.threshold_level))?;
        let email = render(template, event);
        let message_id = self.transport.send(&email).await?;
        Ok(Delivery {
            message_id: Some(message_id),
            recipients: email.to,
        })
    }
}

/// Request body of `POST /api/alert-operator`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    #[serde(default)]
    pub operateur_nom: Option<String>,
    #[serde(default)]
    pub nombre_occurrences: Option<u32>,
    #[serde(default)]
    pub previous_occurrences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect_type: Option<String>,
    /// Forces a configured level instead of deriving it from the counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_level: Option<u32>,
}

impl AlertRequest {
    pub fn from_event(event: &EscalationEvent, forced: bool) -> Self {
        Self {
            operateur_nom: Some(event.operator_name.clone()),
            nombre_occurrences: Some(event.defect_count),
            previous_occurrences: Some(event.previous_count),
            operator_id: event.operator_id.clone(),
            timestamp: Some(event.occurred_at),
            defect_type: event.defect_type.clone(),
            escalation_level: forced.then_some(event.threshold_level),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default)]
    pub escalation_level: Option<u32>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, event: &EscalationEvent) -> Result<Delivery, NotifyError> {
        let request = AlertRequest::from_event(event, true);
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        let raw = response.text().await?;
        let body = match serde_json::from_str::<AlertResponse>(&raw) {
            Ok(body) => body,
            Err(_) => {
                return Err(NotifyError::Rejected {
                    status: status.as_u16(),
                    message: raw,
                })
            }
        };

        if !status.is_success() || !body.success {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                message: body
                    .error
                    .or(body.message)
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        Ok(Delivery {
            message_id: body.email_id,
            recipients: body.recipients,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CapturingTransport;
    use super::*;
    use crate::config::EscalationConfig;
    use chrono::TimeZone;

    fn event(level: u32) -> EscalationEvent {
        EscalationEvent {
            operator_name: "Nadia K.".into(),
            defect_count: 5,
            previous_count: 4,
            threshold_level: level,
            defect_type: Some("Brins coupés".into()),
            occurred_at: Utc.with_ymd_and_hms(2025, 4, 2, 9, 30, 0).unwrap(),
            operator_id: Some("M-204".into()),
        }
    }

    #[test]
    fn render_fills_every_placeholder() {
        let template = EscalationTemplate {
            threshold: 5,
            label: "l2".into(),
            recipients: vec!["a@x".into(), "b@x".into()],
            subject: "{operator} at {count}".into(),
            body: "{previous}->{count} level {level} {defect_type} {timestamp}".into(),
        };
        let email = render(&template, &event(5));
        assert_eq!(email.to.len(), 2);
        assert_eq!(email.subject, "Nadia K. at 5");
        assert_eq!(email.body, "4->5 level 5 Brins coupés 2025-04-02T09:30:00+00:00");
    }

    #[tokio::test]
    async fn template_notifier_picks_level_recipients() {
        let transport = Arc::new(CapturingTransport::default());
        let notifier = TemplateNotifier::new(EscalationConfig::default().levels, transport.clone());

        let delivery = notifier.notify(&event(7)).await.unwrap();
        assert_eq!(delivery.recipients.len(), 3);
        assert_eq!(delivery.message_id.as_deref(), Some("mail-1"));

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].subject.contains("CRITIQUE"));
    }

    #[tokio::test]
    async fn unknown_level_is_an_error_outcome() {
        let notifier = TemplateNotifier::new(Vec::new(), Arc::new(LogTransport));
        let result = notifier.notify(&event(9)).await;
        let outcome = NotifyOutcome::from(&result);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("9"));
    }

    #[test]
    fn alert_request_uses_wire_names() {
        let body = serde_json::to_value(AlertRequest::from_event(&event(5), true)).unwrap();
        assert_eq!(body["operateurNom"], "Nadia K.");
        assert_eq!(body["nombreOccurrences"], 5);
        assert_eq!(body["previousOccurrences"], 4);
        assert_eq!(body["operatorId"], "M-204");
        assert_eq!(body["escalationLevel"], 5);

        let unforced = serde_json::to_value(AlertRequest::from_event(&event(5), false)).unwrap();
        assert!(unforced.get("escalationLevel").is_none());
    }
}
