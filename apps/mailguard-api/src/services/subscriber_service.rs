use std::sync::Arc;

use mailguard_db::{DuplicateEmail, SubscriberStore};
use mailguard_db::models::{
    NewSubscriber, Subscriber, SubscriberFilter, SubscriberProfile, SubscriberStatus,
};
use mailguard_shared::api::Paginated;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::email_validation_service::is_valid_syntax;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriber {
    pub email: String,
    #[serde(default)]
    pub status: Option<SubscriberStatus>,
    #[serde(flatten)]
    pub profile: SubscriberProfile,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriber {
    #[serde(flatten)]
    pub profile: SubscriberProfile,
    pub groups: Option<Vec<String>>,
    pub segments: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryEvent {
    Bounce,
    Complaint,
}

impl DeliveryEvent {
    fn status(self) -> SubscriberStatus {
        match self {
            DeliveryEvent::Bounce => SubscriberStatus::Bounced,
            DeliveryEvent::Complaint => SubscriberStatus::Complained,
        }
    }
}

fn normalize_email(email: &str) -> AppResult<String> {
    let email = email.trim().to_lowercase();
    if !is_valid_syntax(&email) {
        return Err(AppError::validation(format!("Invalid email address: {email}")));
    }
    Ok(email)
}

pub struct SubscriberService {
    store: Arc<dyn SubscriberStore>,
}

impl SubscriberService {
    pub fn new(store: Arc<dyn SubscriberStore>) -> Self {
        Self { store }
    }

    async fn by_email(&self, email: &str) -> AppResult<Subscriber> {
        let email = email.trim().to_lowercase();
        self.store
            .find_subscriber_by_email(&email)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Subscriber {email} not found")))
    }

    /// A concurrent insert of the same email loses at the store and becomes a conflict.
    async fn insert(&self, new: NewSubscriber) -> AppResult<Subscriber> {
        self.store.create_subscriber(new).await.map_err(|e| {
            match e.downcast_ref::<DuplicateEmail>() {
                Some(dup) => AppError::Conflict(dup.to_string()),
                None => AppError::Internal(e),
            }
        })
    }

    pub async fn create(&self, req: CreateSubscriber) -> AppResult<Subscriber> {
        let email = normalize_email(&req.email)?;
        if self.store.find_subscriber_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "Subscriber with email {email} already exists"
            )));
        }
        let sub = self
            .insert(NewSubscriber {
                email,
                status: req.status.unwrap_or(SubscriberStatus::Pending),
                profile: req.profile,
                groups: req.groups,
                segments: req.segments,
                validation_result: None,
            })
            .await?;
        info!("Subscriber created: {}", sub.id);
        Ok(sub)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Subscriber> {
        self.store
            .get_subscriber(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Subscriber {id} not found")))
    }

    pub async fn list(&self, mut filter: SubscriberFilter) -> AppResult<Paginated<Subscriber>> {
        filter.page = filter.page.max(1);
        if filter.limit == 0 {
            filter.limit = 20;
        }
        let (items, total) = self.store.list_subscribers(&filter).await?;
        Ok(Paginated::new(items, total, filter.page, filter.limit))
    }

    pub async fn update(&self, id: Uuid, req: UpdateSubscriber) -> AppResult<Subscriber> {
        let mut sub = self.get(id).await?;
        let mut profile = sub.profile();
        profile.merge_non_empty(&req.profile);
        sub.apply_profile(profile);
        if let Some(groups) = req.groups {
            sub.groups = groups;
        }
        if let Some(segments) = req.segments {
            sub.segments = segments;
        }
        Ok(self.store.save_subscriber(&sub).await?)
    }

    /// Pending on first signup; a lapsed subscriber goes back to pending.
    pub async fn subscribe(&self, email: &str) -> AppResult<Subscriber> {
        let email = normalize_email(email)?;
        match self.store.find_subscriber_by_email(&email).await? {
            Some(sub) if sub.status == SubscriberStatus::Active => Ok(sub),
            Some(mut sub) => {
                sub.status = SubscriberStatus::Pending;
                sub.opt_out_reason = None;
                info!("Subscriber {} reactivated", sub.id);
                Ok(self.store.save_subscriber(&sub).await?)
            }
            None => {
                let sub = self
                    .insert(NewSubscriber {
                        email,
                        status: SubscriberStatus::Pending,
                        profile: SubscriberProfile::default(),
                        groups: Vec::new(),
                        segments: Vec::new(),
                        validation_result: None,
                    })
                    .await?;
                info!("New subscriber signed up: {}", sub.id);
                Ok(sub)
            }
        }
    }

    pub async fn unsubscribe(&self, email: &str, reason: Option<String>) -> AppResult<Subscriber> {
        let mut sub = self.by_email(email).await?;
        sub.status = SubscriberStatus::Unsubscribed;
        sub.opt_out_reason = reason;
        info!("Subscriber {} unsubscribed", sub.id);
        Ok(self.store.save_subscriber(&sub).await?)
    }

    pub async fn record_delivery_event(&self, email: &str, event: DeliveryEvent) -> AppResult<Subscriber> {
        let mut sub = self.by_email(email).await?;
        sub.status = event.status();
        info!("Subscriber {} marked {}", sub.id, sub.status.as_str());
        Ok(self.store.save_subscriber(&sub).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailguard_db::MemoryStore;

    fn service() -> SubscriberService {
        SubscriberService::new(Arc::new(MemoryStore::new()))
    }

    fn create_req(email: &str) -> CreateSubscriber {
        serde_json::from_value(serde_json::json!({"email": email, "firstName": "Ann"})).unwrap()
    }

    #[tokio::test]
    async fn create_normalizes_and_rejects_duplicates() {
        let svc = service();
        let sub = svc.create(create_req(" Ann@Example.COM ")).await.unwrap();
        assert_eq!(sub.email, "ann@example.com");
        assert_eq!(sub.first_name.as_deref(), Some("Ann"));
        assert_eq!(sub.status, SubscriberStatus::Pending);

        let err = svc.create(create_req("ann@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = svc.create(create_req("not an email")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    /// Lookup that never sees the row, as when another request inserts it concurrently.
    struct StaleLookup(MemoryStore);

    #[async_trait::async_trait]
    impl SubscriberStore for StaleLookup {
        fn backend_name(&self) -> &'static str {
            "stale"
        }
        async fn create_subscriber(&self, new: NewSubscriber) -> anyhow::Result<Subscriber> {
            self.0.create_subscriber(new).await
        }
        async fn get_subscriber(&self, id: Uuid) -> anyhow::Result<Option<Subscriber>> {
            self.0.get_subscriber(id).await
        }
        async fn find_subscriber_by_email(&self, _email: &str) -> anyhow::Result<Option<Subscriber>> {
            Ok(None)
        }
        async fn find_subscribers_by_emails(&self, emails: &[String]) -> anyhow::Result<Vec<Subscriber>> {
            self.0.find_subscribers_by_emails(emails).await
        }
        async fn save_subscriber(&self, sub: &Subscriber) -> anyhow::Result<Subscriber> {
            self.0.save_subscriber(sub).await
        }
        async fn list_subscribers(
            &self,
            filter: &SubscriberFilter,
        ) -> anyhow::Result<(Vec<Subscriber>, i64)> {
            self.0.list_subscribers(filter).await
        }
    }

    #[tokio::test]
    async fn racing_insert_is_a_conflict() {
        let svc = SubscriberService::new(Arc::new(StaleLookup(MemoryStore::new())));
        svc.create(create_req("ann@example.com")).await.unwrap();

        let err = svc.create(create_req("ann@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{err:?}");
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);

        let err = svc.subscribe("ann@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let svc = service();
        let sub = svc.subscribe("bob@example.com").await.unwrap();
        assert_eq!(sub.status, SubscriberStatus::Pending);

        let sub = svc
            .unsubscribe("BOB@example.com", Some("too many emails".into()))
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriberStatus::Unsubscribed);
        assert_eq!(sub.opt_out_reason.as_deref(), Some("too many emails"));

        let sub = svc.subscribe("bob@example.com").await.unwrap();
        assert_eq!(sub.status, SubscriberStatus::Pending);
        assert_eq!(sub.opt_out_reason, None);

        let sub = svc
            .record_delivery_event("bob@example.com", DeliveryEvent::Complaint)
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriberStatus::Complained);

        let err = svc
            .record_delivery_event("ghost@example.com", DeliveryEvent::Bounce)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_keeps_unset_fields() {
        let svc = service();
        let sub = svc.create(create_req("ann@example.com")).await.unwrap();
        let req: UpdateSubscriber =
            serde_json::from_value(serde_json::json!({"company": "Acme", "groups": ["vip"]})).unwrap();
        let sub = svc.update(sub.id, req).await.unwrap();
        assert_eq!(sub.first_name.as_deref(), Some("Ann"));
        assert_eq!(sub.company.as_deref(), Some("Acme"));
        assert_eq!(sub.groups, vec!["vip"]);

        let page = svc.list(SubscriberFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.limit, 20);
    }
}
