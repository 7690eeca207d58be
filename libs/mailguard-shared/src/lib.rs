use serde::{Deserialize, Serialize};

pub mod api {
    use super::*;

    /// Envelope used by every JSON endpoint.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct ApiResponse<T> {
        pub success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub data: Option<T>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub error: Option<ApiErrorBody>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ApiErrorBody {
        pub message: String,
        pub code: String,
    }

    impl<T> ApiResponse<T> {
        pub fn ok(data: T) -> Self {
            Self {
                success: true,
                data: Some(data),
                error: None,
            }
        }
    }

    impl ApiResponse<()> {
        pub fn err(message: impl Into<String>, code: impl Into<String>) -> Self {
            Self {
                success: false,
                data: None,
                error: Some(ApiErrorBody {
                    message: message.into(),
                    code: code.into(),
                }),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Paginated<T> {
        pub items: Vec<T>,
        pub total: i64,
        pub page: u32,
        pub limit: u32,
        pub total_pages: u32,
    }

    impl<T> Paginated<T> {
        pub fn new(items: Vec<T>, total: i64, page: u32, limit: u32) -> Self {
            let total_pages = if limit == 0 {
                0
            } else {
                ((total.max(0) as u64).div_ceil(limit as u64)) as u32
            };
            Self {
                items,
                total,
                page,
                limit,
                total_pages,
            }
        }
    }
}

pub mod reputation {
    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum IpReputation {
        Clean,
        Listed,
        Unknown,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct IpReputationResult {
        pub ip: String,
        pub is_listed: bool,
        pub reputation: IpReputation,
        pub confidence: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub listed_on: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub errors: Option<Vec<String>>,
        pub details: String,
    }

    impl IpReputationResult {
        pub fn unknown(ip: &str, details: impl Into<String>) -> Self {
            Self {
                ip: ip.to_string(),
                is_listed: false,
                reputation: IpReputation::Unknown,
                confidence: 0,
                listed_on: None,
                errors: None,
                details: details.into(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum DomainReputation {
        Good,
        Poor,
        Unknown,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct DomainReputationResult {
        pub domain: String,
        pub is_suspicious: bool,
        pub reputation: DomainReputation,
        pub confidence: u8,
        pub details: String,
    }

    /// Sender IP rating as seen by the email validator.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum SenderRating {
        Good,
        Neutral,
        Poor,
        Unknown,
    }

    impl From<IpReputation> for SenderRating {
        fn from(r: IpReputation) -> Self {
            match r {
                IpReputation::Clean => SenderRating::Good,
                IpReputation::Listed => SenderRating::Poor,
                IpReputation::Unknown => SenderRating::Unknown,
            }
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum EmailStatus {
        Valid,
        Invalid,
        Risky,
        Unknown,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct CheckOutcome {
        pub is_valid: bool,
        pub details: String,
    }

    impl CheckOutcome {
        pub fn pass(details: impl Into<String>) -> Self {
            Self {
                is_valid: true,
                details: details.into(),
            }
        }

        pub fn fail(details: impl Into<String>) -> Self {
            Self {
                is_valid: false,
                details: details.into(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct TypoCheck {
        pub is_valid: bool,
        pub details: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub suggestion: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct SenderReputationCheck {
        pub is_valid: bool,
        pub details: String,
        pub reputation: SenderRating,
        pub confidence: u8,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct DomainReputationCheck {
        pub is_valid: bool,
        pub details: String,
        pub reputation: DomainReputation,
        pub is_suspicious: bool,
        pub confidence: u8,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EmailChecks {
        pub syntax: CheckOutcome,
        pub domain: CheckOutcome,
        pub mx: CheckOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub disposable: Option<CheckOutcome>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub role_account: Option<CheckOutcome>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub typo: Option<TypoCheck>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub ip_reputation: Option<SenderReputationCheck>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub domain_reputation: Option<DomainReputationCheck>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EmailValidationResult {
        pub email: String,
        pub is_valid: bool,
        pub status: EmailStatus,
        pub confidence: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub checks: Option<EmailChecks>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    impl EmailValidationResult {
        pub fn suggestion(&self) -> Option<&str> {
            self.checks
                .as_ref()
                .and_then(|c| c.typo.as_ref())
                .and_then(|t| t.suggestion.as_deref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::api::*;
    use super::reputation::*;

    #[test]
    fn invalid_ip_result_has_exactly_five_keys() {
        let r = IpReputationResult::unknown("invalid-ip", "Invalid IP address format");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "ip": "invalid-ip",
                "isListed": false,
                "reputation": "unknown",
                "confidence": 0,
                "details": "Invalid IP address format"
            })
        );
    }

    #[test]
    fn error_envelope_omits_data() {
        let v = serde_json::to_value(ApiResponse::err("nope", "NOT_FOUND")).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"success": false, "error": {"message": "nope", "code": "NOT_FOUND"}})
        );
    }

    #[test]
    fn paginated_rounds_pages_up() {
        let p = Paginated::new(vec![1, 2], 41, 1, 20);
        assert_eq!(p.total_pages, 3);
        assert_eq!(Paginated::<u8>::new(vec![], 0, 1, 20).total_pages, 0);
    }
}
