use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Pending,
    Active,
    Bounced,
    Complained,
    Unsubscribed,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Pending => "pending",
            SubscriberStatus::Active => "active",
            SubscriberStatus::Bounced => "bounced",
            SubscriberStatus::Complained => "complained",
            SubscriberStatus::Unsubscribed => "unsubscribed",
        }
    }

    /// Unknown values fall back to `Pending`.
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => SubscriberStatus::Active,
            "bounced" => SubscriberStatus::Bounced,
            "complained" => SubscriberStatus::Complained,
            "unsubscribed" => SubscriberStatus::Unsubscribed,
            _ => SubscriberStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub status: SubscriberStatus,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub groups: Vec<String>,
    pub segments: Vec<String>,
    pub custom_fields: serde_json::Value,
    pub validation_result: Option<String>,
    pub opt_out_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields shared by create and update paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

impl SubscriberProfile {
    /// Overwrite only the fields that are present in `other`.
    pub fn merge_non_empty(&mut self, other: &SubscriberProfile) {
        fn pick(dst: &mut Option<String>, src: &Option<String>) {
            if let Some(v) = src.as_ref().filter(|v| !v.is_empty()) {
                *dst = Some(v.clone());
            }
        }
        pick(&mut self.first_name, &other.first_name);
        pick(&mut self.last_name, &other.last_name);
        pick(&mut self.company, &other.company);
        pick(&mut self.phone, &other.phone);
        pick(&mut self.location, &other.location);
        for (k, v) in &other.custom_fields {
            self.custom_fields.insert(k.clone(), v.clone());
        }
    }
}

impl Subscriber {
    pub fn profile(&self) -> SubscriberProfile {
        SubscriberProfile {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            company: self.company.clone(),
            phone: self.phone.clone(),
            location: self.location.clone(),
            custom_fields: self.custom_fields.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn apply_profile(&mut self, profile: SubscriberProfile) {
        self.first_name = profile.first_name;
        self.last_name = profile.last_name;
        self.company = profile.company;
        self.phone = profile.phone;
        self.location = profile.location;
        self.custom_fields = serde_json::Value::Object(profile.custom_fields);
    }

    /// Add entries not yet present, keeping the existing order.
    pub fn merge_groups(&mut self, groups: &[String], segments: &[String]) {
        for g in groups {
            if !self.groups.contains(g) {
                self.groups.push(g.clone());
            }
        }
        for s in segments {
            if !self.segments.contains(s) {
                self.segments.push(s.clone());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscriber {
    pub email: String,
    pub status: SubscriberStatus,
    pub profile: SubscriberProfile,
    pub groups: Vec<String>,
    pub segments: Vec<String>,
    pub validation_result: Option<String>,
}

impl NewSubscriber {
    pub fn into_subscriber(self) -> Subscriber {
        let now = Utc::now();
        let mut sub = Subscriber {
            id: Uuid::new_v4(),
            email: self.email,
            status: self.status,
            first_name: None,
            last_name: None,
            company: None,
            phone: None,
            location: None,
            groups: Vec::new(),
            segments: Vec::new(),
            custom_fields: serde_json::Value::Object(Default::default()),
            validation_result: self.validation_result,
            opt_out_reason: None,
            created_at: now,
            updated_at: now,
        };
        sub.apply_profile(self.profile);
        sub.merge_groups(&self.groups, &self.segments);
        sub
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriberFilter {
    pub status: Option<SubscriberStatus>,
    pub page: u32,
    pub limit: u32,
}
