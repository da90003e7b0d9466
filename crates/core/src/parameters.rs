use std::{borrow::Cow, collections::BTreeMap, sync::OnceLock};

use regex::{Captures, Regex};

use crate::types::NotificationRecord;

pub const PARAM_SUBJECT: &str = "sns.message.subject";
pub const PARAM_BODY: &str = "sns.message.body";
pub const PARAM_ATTRIBUTES_PREFIX: &str = "sns.message.attributes.";

const SUBJECT: &str = "subject";
const BODY: &str = "body";
const ATTRIBUTES_PREFIX: &str = "attributes.";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$\{sns\.message\.(?P<brace>subject|body|attributes\.[^}\s]+)\}|%sns\.message\.(?P<percent>subject|body|attributes\.[^%\s]+)%",
        )
        .expect("placeholder pattern is valid")
    })
}

/// Replaces every `sns.message.*` placeholder in `template` in a single pass.
///
/// Both `${sns.message.subject}` and `%sns.message.subject%` forms are
/// recognised. Substituted text is never expanded again. Missing values, or a
/// missing record, substitute the empty string.
pub fn substitute<'a>(template: &'a str, record: Option<&NotificationRecord>) -> Cow<'a, str> {
    placeholder_pattern().replace_all(template, |captures: &Captures<'_>| {
        let reference = captures
            .name("brace")
            .or_else(|| captures.name("percent"))
            .map(|found| found.as_str())
            .unwrap_or_default();
        record
            .and_then(|record| resolve(reference, record))
            .unwrap_or_default()
            .to_string()
    })
}

fn resolve<'r>(reference: &str, record: &'r NotificationRecord) -> Option<&'r str> {
    match reference {
        SUBJECT => record.subject.as_deref(),
        BODY => record.message.as_deref(),
        other => other
            .strip_prefix(ATTRIBUTES_PREFIX)
            .and_then(|name| record.attribute_value(name)),
    }
}

/// Custom build parameters describing `record`; absent values are omitted.
pub fn message_parameters(record: &NotificationRecord) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    if let Some(subject) = &record.subject {
        parameters.insert(PARAM_SUBJECT.to_string(), subject.clone());
    }
    if let Some(body) = &record.message {
        parameters.insert(PARAM_BODY.to_string(), body.clone());
    }
    for (name, attribute) in &record.attributes {
        if let Some(value) = &attribute.value {
            parameters.insert(format!("{PARAM_ATTRIBUTES_PREFIX}{name}"), value.clone());
        }
    }
    parameters
}

/// Message parameters merged with substituted trigger templates. Templates win on clashes.
pub fn build_parameters(
    templates: &BTreeMap<String, String>,
    record: &NotificationRecord,
) -> BTreeMap<String, String> {
    let mut parameters = message_parameters(record);
    for (name, template) in templates {
        parameters.insert(name.clone(), substitute(template, Some(record)).into_owned());
    }
    parameters
}
