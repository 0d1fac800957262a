use futures::future::join_all;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::mailer::{Template, Variables};
use crate::model::Booking;
use crate::observability;
use crate::timeutil::format_iso;

use super::Engine;

/// A message to one user, queued until the mutation has been persisted.
#[derive(Debug, Clone)]
pub(super) struct Notice {
    pub user_id: Ulid,
    pub template: Template,
    pub variables: Variables,
}

impl Notice {
    /// Addressed to the booking's owner, with the booking fields filled in.
    pub fn to_owner(booking: &Booking, template: Template) -> Self {
        let variables = Variables::from([
            ("booking_id".to_string(), booking.id.to_string()),
            ("instrument".to_string(), booking.instrument_name.clone()),
            ("user_name".to_string(), booking.user_name.clone()),
            ("start".to_string(), format_iso(booking.span.start)),
            ("end".to_string(), format_iso(booking.span.end)),
            ("purpose".to_string(), booking.purpose.clone()),
            ("status".to_string(), booking.status().to_string()),
        ]);
        Self {
            user_id: booking.user_id,
            template,
            variables,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }
}

impl Engine {
    /// Deliver one notice. Failures are logged and counted, never returned.
    pub(super) async fn deliver(&self, notice: Notice) -> bool {
        let template = notice.template.as_str();
        let Some(to) = self.directory.resolve_user_email(notice.user_id) else {
            warn!(user = %notice.user_id, template, "no e-mail address, notification dropped");
            metrics::counter!(observability::NOTIFICATIONS_TOTAL, "template" => template, "status" => "unaddressed")
                .increment(1);
            return false;
        };
        let ok = self.mailer.notify(&to, template, &notice.variables).await;
        if ok {
            debug!(%to, template, "notification sent");
        } else {
            warn!(%to, template, "notification failed");
        }
        let status = if ok { "sent" } else { "failed" };
        metrics::counter!(observability::NOTIFICATIONS_TOTAL, "template" => template, "status" => status)
            .increment(1);
        ok
    }

    /// Deliver concurrently; returns how many went out.
    pub(super) async fn deliver_all(&self, notices: Vec<Notice>) -> usize {
        join_all(notices.into_iter().map(|n| self.deliver(n)))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }
}
