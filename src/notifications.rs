//! Appointment notification fan-out: in-app rows + hub push + gateways.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::template::{escape_html, render};
use crate::gateways::{MessageGateway, OutboundMessage};
use crate::hub::{HubMessage, HubTarget, NotificationHub, NotificationPayload};
use crate::models::{AppointmentDetailRow, Channel};

/// Role group that hears about every booking change.
pub const FRONT_DESK_ROLE: &str = "Receptionist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentEvent {
    Created,
    Rescheduled,
    Cancelled,
    Reminder,
}

impl AppointmentEvent {
    pub fn code(&self) -> &'static str {
        match self {
            AppointmentEvent::Created => "appointment_created",
            AppointmentEvent::Rescheduled => "appointment_rescheduled",
            AppointmentEvent::Cancelled => "appointment_cancelled",
            AppointmentEvent::Reminder => "appointment_reminder",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            AppointmentEvent::Created => "Nueva cita agendada",
            AppointmentEvent::Rescheduled => "Cita reprogramada",
            AppointmentEvent::Cancelled => "Cita cancelada",
            AppointmentEvent::Reminder => "Recordatorio de cita",
        }
    }
}

/// Built-in text used when no active template exists.
pub fn default_template(event: AppointmentEvent, channel: Channel) -> (Option<&'static str>, &'static str) {
    match (event, channel) {
        (AppointmentEvent::Created, Channel::Email) => (
            Some("Confirmación de cita {{appointment_number}}"),
            "<p>Hola {{client_name}},</p><p>Su cita {{appointment_number}} quedó agendada para el {{appointment_date}} a las {{appointment_time}} en {{branch_name}}.</p>",
        ),
        (AppointmentEvent::Created, _) => (
            None,
            "Cita {{appointment_number}} agendada para {{client_name}} el {{appointment_date}} a las {{appointment_time}} en {{branch_name}}.",
        ),
        (AppointmentEvent::Rescheduled, Channel::Email) => (
            Some("Cita {{appointment_number}} reprogramada"),
            "<p>Hola {{client_name}},</p><p>Su cita {{appointment_number}} ahora es el {{appointment_date}} a las {{appointment_time}} en {{branch_name}}.</p>",
        ),
        (AppointmentEvent::Rescheduled, _) => (
            None,
            "Cita {{appointment_number}} de {{client_name}} reprogramada para el {{appointment_date}} a las {{appointment_time}}.",
        ),
        (AppointmentEvent::Cancelled, Channel::Email) => (
            Some("Cita {{appointment_number}} cancelada"),
            "<p>Hola {{client_name}},</p><p>Su cita {{appointment_number}} del {{appointment_date}} fue cancelada. Motivo: {{cancellation_reason}}.</p>",
        ),
        (AppointmentEvent::Cancelled, _) => (
            None,
            "Cita {{appointment_number}} de {{client_name}} del {{appointment_date}} cancelada. Motivo: {{cancellation_reason}}.",
        ),
        (AppointmentEvent::Reminder, Channel::Email) => (
            Some("Recordatorio de cita {{appointment_number}}"),
            "<p>Hola {{client_name}},</p><p>Le recordamos su cita {{appointment_number}} el {{appointment_date}} a las {{appointment_time}} en {{branch_name}}.</p>",
        ),
        (AppointmentEvent::Reminder, _) => (
            None,
            "Recordatorio: {{client_name}}, su cita {{appointment_number}} es el {{appointment_date}} a las {{appointment_time}} en {{branch_name}}.",
        ),
    }
}

pub fn template_values(appt: &AppointmentDetailRow, company_name: &str) -> HashMap<&'static str, String> {
    HashMap::from([
        ("client_name", appt.client_name.clone()),
        ("appointment_number", appt.appointment_number.clone()),
        ("appointment_date", appt.scheduled_date.format("%d/%m/%Y").to_string()),
        ("appointment_time", appt.scheduled_time.format("%H:%M").to_string()),
        ("branch_name", appt.branch_name.clone()),
        ("branch_address", appt.branch_address.clone().unwrap_or_default()),
        (
            "cancellation_reason",
            appt.cancellation_reason.clone().unwrap_or_default(),
        ),
        ("company_name", company_name.to_string()),
    ])
}

/// Renders subject and body. Email bodies are HTML, so values are escaped
/// there; subjects and the other channels are plain text.
pub fn render_for_channel(
    channel: Channel,
    subject: Option<&str>,
    body: &str,
    values: &HashMap<&'static str, String>,
) -> (Option<String>, String) {
    let subject = subject.map(|s| render(s, values));
    let body = if channel == Channel::Email {
        let escaped: HashMap<&str, String> =
            values.iter().map(|(k, v)| (*k, escape_html(v))).collect();
        render(body, &escaped)
    } else {
        render(body, values)
    };
    (subject, body)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub attempted: usize,
    pub delivered: usize,
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    subject: Option<String>,
    body: String,
}

#[derive(sqlx::FromRow)]
struct InsertedNotification {
    notification_id: Uuid,
    created_at: DateTime<Utc>,
}

pub struct NotificationService {
    db: sqlx::PgPool,
    hub: NotificationHub,
    whatsapp: Option<Arc<dyn MessageGateway>>,
    email: Option<Arc<dyn MessageGateway>>,
}

impl NotificationService {
    pub fn new(
        db: sqlx::PgPool,
        hub: NotificationHub,
        whatsapp: Option<Arc<dyn MessageGateway>>,
        email: Option<Arc<dyn MessageGateway>>,
    ) -> Self {
        Self { db, hub, whatsapp, email }
    }

    /// Full fan-out for a booking change. Failures are logged, never returned.
    pub async fn appointment_event(
        &self,
        event: AppointmentEvent,
        appt: &AppointmentDetailRow,
        actor: Option<Uuid>,
    ) {
        let company = self.company_name().await;
        let values = template_values(appt, &company);

        let (_, body) = self.template(event, Channel::InApp, &values).await;
        let mut targets = vec![HubTarget::Role(FRONT_DESK_ROLE.to_string())];
        if let Some(user_id) = actor {
            targets.push(HubTarget::User(user_id));
        }
        for target in targets {
            if let Err(e) = self.store_and_push(target, event, &body, appt.appointment_id).await {
                tracing::error!(
                    appointment_id = %appt.appointment_id,
                    kind = event.code(),
                    error = %e,
                    "failed to store in-app notification"
                );
            }
        }

        let delivery = self.deliver_external(event, appt, &values).await;
        tracing::info!(
            appointment_id = %appt.appointment_id,
            kind = event.code(),
            attempted = delivery.attempted,
            delivered = delivery.delivered,
            "appointment notifications dispatched"
        );
    }

    /// Reminder goes to the client only.
    pub async fn send_reminder(&self, appt: &AppointmentDetailRow) -> Delivery {
        let company = self.company_name().await;
        let values = template_values(appt, &company);
        self.deliver_external(AppointmentEvent::Reminder, appt, &values).await
    }

    pub async fn deliver_external(
        &self,
        event: AppointmentEvent,
        appt: &AppointmentDetailRow,
        values: &HashMap<&'static str, String>,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        let channels = [
            (Channel::Whatsapp, self.whatsapp.as_ref(), appt.client_phone.as_deref()),
            (Channel::Email, self.email.as_ref(), appt.client_email.as_deref()),
        ];

        for (channel, gateway, to) in channels {
            let (Some(gateway), Some(to)) = (gateway, to) else { continue };
            let (subject, body) = self.template(event, channel, values).await;
            delivery.attempted += 1;
            let message = OutboundMessage {
                to: to.to_string(),
                subject,
                body,
            };
            match gateway.send(&message).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => tracing::warn!(
                    gateway = gateway.name(),
                    appointment_id = %appt.appointment_id,
                    error = %e,
                    "could not notify client"
                ),
            }
        }
        delivery
    }

    async fn template(
        &self,
        event: AppointmentEvent,
        channel: Channel,
        values: &HashMap<&'static str, String>,
    ) -> (Option<String>, String) {
        let stored: Option<TemplateRow> = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT subject, body
            FROM notification_template
            WHERE code = $1 AND channel = $2 AND is_active = true
            "#,
        )
        .bind(event.code())
        .bind(channel.as_str())
        .fetch_optional(&self.db)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "template lookup failed, using default");
            None
        });

        let (subject, body) = match stored {
            Some(t) => (t.subject, t.body),
            None => {
                let (s, b) = default_template(event, channel);
                (s.map(str::to_string), b.to_string())
            }
        };
        render_for_channel(channel, subject.as_deref(), &body, values)
    }

    async fn company_name(&self) -> String {
        sqlx::query_scalar::<_, String>(
            r#"SELECT company_name FROM theme_settings WHERE singleton_id = TRUE"#,
        )
        .fetch_optional(&self.db)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "PQR".to_string())
    }

    async fn store_and_push(
        &self,
        target: HubTarget,
        event: AppointmentEvent,
        message: &str,
        appointment_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        let (user_id, role_name) = match &target {
            HubTarget::User(id) => (Some(*id), None),
            HubTarget::Role(name) => (None, Some(name.as_str())),
        };

        let row: InsertedNotification = sqlx::query_as::<_, InsertedNotification>(
            r#"
            INSERT INTO notification (user_id, role_name, title, message, kind, appointment_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING notification_id, created_at
            "#,
        )
        .bind(user_id)
        .bind(role_name)
        .bind(event.title())
        .bind(message)
        .bind(event.code())
        .bind(appointment_id)
        .fetch_one(&self.db)
        .await?;

        self.hub.publish(HubMessage {
            target,
            payload: NotificationPayload {
                notification_id: row.notification_id,
                title: event.title().to_string(),
                message: message.to_string(),
                kind: event.code().to_string(),
                appointment_id: Some(appointment_id),
                created_at: row.created_at,
            },
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::GatewayError;
    use crate::models::AppointmentStatus;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageGateway for RecordingGateway {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, message: &OutboundMessage) -> Result<(), GatewayError> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail {
                Err(GatewayError::Rejected("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn appointment(phone: Option<&str>, email: Option<&str>) -> AppointmentDetailRow {
        AppointmentDetailRow {
            appointment_id: Uuid::new_v4(),
            appointment_number: "APT-20261015-3F2A9C1B".into(),
            client_id: Uuid::new_v4(),
            client_name: "Ana Ruiz".into(),
            client_document: "1020304050".into(),
            client_phone: phone.map(str::to_string),
            client_email: email.map(str::to_string),
            branch_id: Uuid::new_v4(),
            branch_name: "Sede Centro".into(),
            branch_address: Some("Calle 10 # 5-20".into()),
            appointment_type_id: None,
            appointment_type_name: None,
            scheduled_date: NaiveDate::from_ymd_opt(2026, 10, 15).unwrap(),
            scheduled_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            status: AppointmentStatus::Pending,
            notes: None,
            cancellation_reason: None,
            reminder_sent_at: None,
            completed_at: None,
            cancelled_at: None,
            created_by_user_id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // Pool that never connects; template lookups fail and fall back to defaults.
    fn offline_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(50))
            .connect_lazy("postgres://nobody@127.0.0.1:9/none")
            .unwrap()
    }

    #[test]
    fn values_format_date_and_time() {
        let v = template_values(&appointment(None, None), "Acueducto");
        assert_eq!(v["appointment_date"], "15/10/2026");
        assert_eq!(v["appointment_time"], "09:30");
        assert_eq!(v["company_name"], "Acueducto");
        assert_eq!(v["cancellation_reason"], "");
    }

    #[test]
    fn every_default_template_renders_fully() {
        let v = template_values(&appointment(None, None), "Acueducto");
        for event in [
            AppointmentEvent::Created,
            AppointmentEvent::Rescheduled,
            AppointmentEvent::Cancelled,
            AppointmentEvent::Reminder,
        ] {
            for channel in [Channel::InApp, Channel::Whatsapp, Channel::Email] {
                let (subject, body) = default_template(event, channel);
                assert!(!render(body, &v).contains("{{"), "{event:?}/{channel:?}");
                if let Some(s) = subject {
                    assert!(!render(s, &v).contains("{{"));
                }
            }
        }
    }

    #[test]
    fn email_bodies_escape_client_text() {
        let mut appt = appointment(None, None);
        appt.client_name = "<script>alert(1)</script>".into();
        let v = template_values(&appt, "Acueducto");
        let (subject, body) = default_template(AppointmentEvent::Created, Channel::Email);

        let (_, html) = render_for_channel(Channel::Email, subject, body, &v);
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(!html.contains("<script>"));

        let (_, text) = render_for_channel(Channel::Whatsapp, None, "{{client_name}}", &v);
        assert_eq!(text, "<script>alert(1)</script>");
    }

    #[tokio::test]
    async fn fan_out_failures_are_only_logged() {
        let whatsapp = Arc::new(RecordingGateway { fail: true, ..Default::default() });
        let service = NotificationService::new(
            offline_pool(),
            NotificationHub::new(),
            Some(whatsapp.clone() as Arc<dyn MessageGateway>),
            None,
        );
        let appt = appointment(Some("+573001234567"), None);

        // storage and gateway both fail; the call still completes normally
        service
            .appointment_event(AppointmentEvent::Created, &appt, Some(Uuid::new_v4()))
            .await;
        assert_eq!(whatsapp.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_delivery_uses_available_contacts_only() {
        let whatsapp = Arc::new(RecordingGateway::default());
        let email = Arc::new(RecordingGateway { fail: true, ..Default::default() });
        let service = NotificationService::new(
            offline_pool(),
            NotificationHub::new(),
            Some(whatsapp.clone() as Arc<dyn MessageGateway>),
            Some(email.clone() as Arc<dyn MessageGateway>),
        );

        let appt = appointment(Some("+573001234567"), Some("ana@empresa.co"));
        let values = template_values(&appt, "Acueducto");
        let delivery = service
            .deliver_external(AppointmentEvent::Created, &appt, &values)
            .await;
        assert_eq!(delivery, Delivery { attempted: 2, delivered: 1 });

        let sent = whatsapp.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+573001234567");
        assert!(sent[0].body.contains("APT-20261015-3F2A9C1B"));
        assert_eq!(email.sent.lock().unwrap()[0].subject.as_deref(), Some("Confirmación de cita APT-20261015-3F2A9C1B"));

        let no_contacts = appointment(None, None);
        let delivery = service
            .deliver_external(AppointmentEvent::Created, &no_contacts, &values)
            .await;
        assert_eq!(delivery, Delivery::default());
    }
}
