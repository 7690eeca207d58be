pub mod bulk_import_service;
pub mod csv_service;
pub mod email_validation_service;
pub mod file_security_service;
pub mod file_upload_service;
pub mod import_integration_service;
pub mod import_processor;
pub mod reputation_service;
pub mod subscriber_service;
