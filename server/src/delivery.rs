use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DeliveryError;
use crate::platform::{PlatformApi, ReplyTarget};
use crate::types::{Channel, InboundEvent, PageConfig, ParticipantKey};

/// Single-attempt sender. Failures are returned to the caller and never retried.
pub struct OutboundDelivery {
    platform: Arc<dyn PlatformApi>,
}

impl OutboundDelivery {
    pub fn new(platform: Arc<dyn PlatformApi>) -> Self {
        Self { platform }
    }

    /// Replies on the channel the event arrived on.
    pub async fn deliver_reply(
        &self,
        event: &InboundEvent,
        text: &str,
        page: &PageConfig,
    ) -> Result<String, DeliveryError> {
        let target = match event.channel {
            Channel::Message => ReplyTarget::Message {
                recipient_id: event.participant_id.clone(),
                human_agent: false,
            },
            Channel::Comment => ReplyTarget::Comment {
                comment_id: event.event_id.clone(),
            },
        };
        self.deliver(&target, text, page).await
    }

    pub async fn deliver_operator_message(
        &self,
        key: &ParticipantKey,
        text: &str,
        page: &PageConfig,
    ) -> Result<String, DeliveryError> {
        let target = ReplyTarget::Message {
            recipient_id: key.participant_id.clone(),
            human_agent: true,
        };
        self.deliver(&target, text, page).await
    }

    pub async fn deliver(
        &self,
        target: &ReplyTarget,
        text: &str,
        page: &PageConfig,
    ) -> Result<String, DeliveryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DeliveryError::EmptyText);
        }
        if page.access_token.trim().is_empty() {
            return Err(DeliveryError::MissingCredential);
        }
        if let ReplyTarget::Comment { comment_id } = target {
            if comment_id.trim().is_empty() {
                return Err(DeliveryError::MissingTarget);
            }
        }

        match self
            .platform
            .post_reply(target, text, page.access_token.trim())
            .await
        {
            Ok(delivery_id) => {
                info!(page = %page.page_id, delivery_id = %delivery_id, "reply delivered");
                Ok(delivery_id)
            }
            Err(err) => {
                warn!(page = %page.page_id, error = %err, "reply delivery failed");
                Err(err.into())
            }
        }
    }
}
