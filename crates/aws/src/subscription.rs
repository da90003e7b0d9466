use quick_xml::{events::Event, Reader};
use thiserror::Error;
use tracing::info;
use url::Url;

use sns_trigger_core::message::{payload_str, Payload, FIELD_SUBSCRIBE_URL};

use crate::http::{HttpApi, HttpApiError};

const RESULT_ELEMENT: &[u8] = b"ConfirmSubscriptionResult";
const ARN_ELEMENT: &[u8] = b"SubscriptionArn";

/// Errors raised while confirming a subscription.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("missing required field: SubscribeURL")]
    MissingSubscribeUrl,
    #[error("invalid subscribe url: {0}")]
    Url(#[from] url::ParseError),
    #[error("subscription confirmation request failed: {0}")]
    Http(#[from] HttpApiError),
    #[error("failed to parse confirmation response: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("confirmation response carries no subscription arn")]
    MissingSubscriptionArn,
}

/// Visits the `SubscribeURL` of a confirmation message and returns the new subscription ARN.
pub async fn confirm_subscription(
    http: &dyn HttpApi,
    payload: &Payload,
) -> Result<String, SubscriptionError> {
    let url = payload_str(payload, FIELD_SUBSCRIBE_URL)
        .ok_or(SubscriptionError::MissingSubscribeUrl)?;
    let url = Url::parse(url.trim())?;

    let body = http.get(&url).await?;
    let subscription_arn = parse_subscription_arn(&body)?;
    info!(
        stage = "subscription",
        %subscription_arn,
        "subscription confirmation accepted"
    );
    Ok(subscription_arn)
}

/// Reads `ConfirmSubscriptionResult/SubscriptionArn` from a confirmation response.
///
/// Element names are compared without namespace prefixes.
pub fn parse_subscription_arn(xml: &str) -> Result<String, SubscriptionError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut collected: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                let name = element.local_name().as_ref().to_vec();
                if is_arn_path(&path, &name) {
                    collected = Some(String::new());
                }
                path.push(name);
            }
            Event::Empty(element) => {
                if is_arn_path(&path, element.local_name().as_ref()) {
                    return Err(SubscriptionError::MissingSubscriptionArn);
                }
            }
            Event::Text(text) => {
                if let Some(buffer) = collected.as_mut() {
                    buffer.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(buffer) = collected.as_mut() {
                    buffer.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                path.pop();
                if let Some(value) = collected.take() {
                    let value = value.trim();
                    if value.is_empty() {
                        return Err(SubscriptionError::MissingSubscriptionArn);
                    }
                    return Ok(value.to_string());
                }
            }
            Event::Eof => return Err(SubscriptionError::MissingSubscriptionArn),
            _ => {}
        }
    }
}

fn is_arn_path(parents: &[Vec<u8>], name: &[u8]) -> bool {
    name == ARN_ELEMENT && parents.last().map(Vec::as_slice) == Some(RESULT_ELEMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ReqwestHttpApi;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    const CONFIRM_RESPONSE: &str = r#"<ConfirmSubscriptionResponse xmlns="http://sns.amazonaws.com/doc/2010-03-31/">
  <ConfirmSubscriptionResult>
    <SubscriptionArn>
      arn:aws:sns:us-east-1:123456789012:builds:2bcfbf39-05c3-41de-beaa-fcfcc21c8f55
    </SubscriptionArn>
  </ConfirmSubscriptionResult>
  <ResponseMetadata>
    <RequestId>075ecce8-8dac-11e1-bf80-f781d96e9307</RequestId>
  </ResponseMetadata>
</ConfirmSubscriptionResponse>"#;

    fn payload(subscribe_url: &str) -> Payload {
        json!({
            "Type": "SubscriptionConfirmation",
            "MessageId": "165545c9-2a5c-472c-8df2-7ff2be2b3b1b",
            "Token": "2336412f37",
            "TopicArn": "arn:aws:sns:us-east-1:123456789012:builds",
            "SubscribeURL": subscribe_url,
            "Timestamp": "2024-04-01T10:00:00.000Z"
        })
        .as_object()
        .cloned()
        .expect("object")
    }

    #[test]
    fn parses_trimmed_arn() {
        assert_eq!(
            parse_subscription_arn(CONFIRM_RESPONSE).expect("arn"),
            "arn:aws:sns:us-east-1:123456789012:builds:2bcfbf39-05c3-41de-beaa-fcfcc21c8f55"
        );
    }

    #[test]
    fn ignores_namespace_prefixes() {
        let xml = r#"<sns:ConfirmSubscriptionResponse xmlns:sns="urn:sns">
            <sns:ConfirmSubscriptionResult><sns:SubscriptionArn>arn:1</sns:SubscriptionArn></sns:ConfirmSubscriptionResult>
        </sns:ConfirmSubscriptionResponse>"#;
        assert_eq!(parse_subscription_arn(xml).expect("arn"), "arn:1");
    }

    #[test]
    fn arn_outside_result_is_ignored() {
        let xml = "<Response><SubscriptionArn>arn:elsewhere</SubscriptionArn>\
                   <ConfirmSubscriptionResult><SubscriptionArn>arn:2</SubscriptionArn>\
                   <SubscriptionArn>arn:3</SubscriptionArn></ConfirmSubscriptionResult></Response>";
        assert_eq!(parse_subscription_arn(xml).expect("arn"), "arn:2");
    }

    #[test]
    fn missing_or_empty_arn_is_an_error() {
        for xml in [
            "<ConfirmSubscriptionResponse><ConfirmSubscriptionResult/></ConfirmSubscriptionResponse>",
            "<ConfirmSubscriptionResult><SubscriptionArn>  </SubscriptionArn></ConfirmSubscriptionResult>",
            "<ConfirmSubscriptionResult><SubscriptionArn/></ConfirmSubscriptionResult>",
        ] {
            assert!(matches!(
                parse_subscription_arn(xml),
                Err(SubscriptionError::MissingSubscriptionArn)
            ));
        }
    }

    #[tokio::test]
    async fn confirm_visits_subscribe_url() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/")
                    .query_param("Action", "ConfirmSubscription")
                    .query_param("Token", "2336412f37");
                then.status(200).body(CONFIRM_RESPONSE);
            })
            .await;

        let http = ReqwestHttpApi::new(Duration::from_secs(5)).expect("client");
        let url = server.url("/?Action=ConfirmSubscription&Token=2336412f37");
        let arn = confirm_subscription(&http, &payload(&url))
            .await
            .expect("confirm");
        mock.assert_async().await;
        assert!(arn.ends_with(":builds:2bcfbf39-05c3-41de-beaa-fcfcc21c8f55"));
    }

    #[tokio::test]
    async fn confirm_fails_on_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(403).body("<ErrorResponse/>");
            })
            .await;

        let http = ReqwestHttpApi::new(Duration::from_secs(5)).expect("client");
        let err = confirm_subscription(&http, &payload(&server.url("/")))
            .await
            .expect_err("forbidden");
        assert!(matches!(
            err,
            SubscriptionError::Http(HttpApiError::Status { .. })
        ));

        let mut without_url = payload("");
        without_url.remove(FIELD_SUBSCRIBE_URL);
        assert!(matches!(
            confirm_subscription(&http, &without_url).await,
            Err(SubscriptionError::MissingSubscribeUrl)
        ));
    }
}
