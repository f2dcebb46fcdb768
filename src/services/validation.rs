//! Upload validation rules.
//!
//! Rules are checked before an upload is persisted. The first failing rule
//! determines the error, so rules carry their own code and message.

use crate::{
    config::StorageConfig,
    errors::{ErrorCode, UploadError, UploadResult},
    models::{File, metadata::metadata_size},
};
use serde_json::json;
use std::{fmt, sync::Arc};

type Predicate = Arc<dyn Fn(&File) -> bool + Send + Sync>;

/// A single named check. The predicate returns `true` when the file is acceptable.
#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    pub code: ErrorCode,
    pub message: String,
    predicate: Predicate,
}

impl ValidationRule {
    pub fn new(
        name: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        predicate: impl Fn(&File) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            code,
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    fn check(&self, file: &File) -> UploadResult<()> {
        if (self.predicate)(file) {
            return Ok(());
        }
        Err(UploadError::with_message(self.code, self.message.clone())
            .with_detail(json!({ "rule": self.name })))
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("code", &self.code)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    rules: Vec<ValidationRule>,
}

impl Validator {
    /// Built-in rules derived from the storage configuration: size, mime
    /// allow-list, filename policy, metadata size.
    pub fn from_config(config: &StorageConfig) -> Self {
        let max_size = config.max_upload_size;
        let allow = config.allow_mime.clone();
        let max_name = config.max_filename_length;
        let max_meta = config.max_metadata_size;

        let mut validator = Self::default();
        validator.add(ValidationRule::new(
            "size",
            ErrorCode::RequestEntityTooLarge,
            format!("file size limit of {max_size} bytes exceeded"),
            move |file| file.size.is_none_or(|size| size <= max_size),
        ));
        validator.add(ValidationRule::new(
            "mime",
            ErrorCode::UnsupportedMediaType,
            "unsupported file type",
            move |file| mime_allowed(&allow, &file.content_type),
        ));
        validator.add(ValidationRule::new(
            "filename",
            ErrorCode::InvalidFileName,
            "invalid file name",
            move |file| filename_allowed(&file.original_name, max_name),
        ));
        validator.add(ValidationRule::new(
            "metadata",
            ErrorCode::MetadataTooLarge,
            format!("metadata size limit of {max_meta} bytes exceeded"),
            move |file| metadata_size(&file.metadata) <= max_meta,
        ));
        validator
    }

    pub fn add(&mut self, rule: ValidationRule) {
        self.rules.push(rule);
    }

    pub fn validate(&self, file: &File) -> UploadResult<()> {
        self.rules.iter().try_for_each(|rule| rule.check(file))
    }
}

/// Match a content type against patterns like `image/*` or `*/*`.
pub fn mime_allowed(patterns: &[String], content_type: &str) -> bool {
    let essence = content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|_| content_type.to_ascii_lowercase());
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.split_once('/') {
            Some(("*", "*")) => true,
            Some((top, "*")) => essence.split('/').next() == Some(top),
            _ => pattern == essence,
        }
    })
}

fn filename_allowed(name: &str, max_len: usize) -> bool {
    name.len() <= max_len
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileInit;

    fn file(name: &str, content_type: &str, size: u64) -> File {
        File::from_init(&FileInit {
            original_name: name.into(),
            content_type: Some(content_type.into()),
            size: Some(size),
            last_modified: Some(1),
            ..FileInit::default()
        })
    }

    #[test]
    fn wildcards_match() {
        let patterns = vec!["image/*".to_string(), "application/pdf".to_string()];
        assert!(mime_allowed(&patterns, "image/png"));
        assert!(mime_allowed(&patterns, "application/pdf; charset=binary"));
        assert!(!mime_allowed(&patterns, "video/mp4"));
    }

    #[test]
    fn first_failing_rule_wins() {
        let config = StorageConfig {
            max_upload_size: 10,
            allow_mime: vec!["text/*".into()],
            ..StorageConfig::default()
        };
        let validator = Validator::from_config(&config);
        assert!(validator.validate(&file("a.txt", "text/plain", 5)).is_ok());
        let err = validator.validate(&file("a.txt", "text/plain", 11)).unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestEntityTooLarge);
        let err = validator.validate(&file("a.png", "image/png", 5)).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedMediaType);
        let err = validator.validate(&file("../a.txt", "text/plain", 5)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFileName);
    }

    #[test]
    fn custom_rules_can_be_added() {
        let mut validator = Validator::default();
        validator.add(ValidationRule::new("nonempty", ErrorCode::InvalidFileSize, "empty", |f| {
            f.size != Some(0)
        }));
        assert!(validator.validate(&file("a", "text/plain", 0)).is_err());
    }
}
