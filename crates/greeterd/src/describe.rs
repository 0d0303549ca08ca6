//! OpenAI-compatible chat-completions client that turns a person crop into
//! a short spoken greeting.

use crate::config::GreetingConfig;
use base64::Engine;
use greeter_core::greeting::{DescribeError, DescriptionService, Greetee};
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Cursor;

pub struct OpenAiDescriber {
    http_client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    guest_prompt: String,
    visitor_prompt: String,
    image_max_side: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Description {
    description: String,
}

impl OpenAiDescriber {
    pub fn new(config: &GreetingConfig) -> Result<Self, DescribeError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DescribeError::Transport(format!("failed to build HTTP client: {e}")))?;

        if config.api_key.is_none() {
            tracing::warn!("no API key configured; greetings will use fallback phrases");
        }

        Ok(Self {
            http_client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            guest_prompt: config.guest_prompt.clone(),
            visitor_prompt: config.visitor_prompt.clone(),
            image_max_side: config.image_max_side,
        })
    }

    fn user_prompt(&self, greetee: &Greetee) -> String {
        match greetee.first_name() {
            Some(name) => self.visitor_prompt.replace("{name}", name),
            None => self.guest_prompt.clone(),
        }
    }

    fn build_payload(&self, image_b64: &str, greetee: &Greetee) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "outfit_description",
                    "schema": {
                        "type": "object",
                        "properties": {
                            "description": {
                                "type": "string",
                                "description": "Flattering outfit description and welcome message"
                            }
                        },
                        "required": ["description"],
                        "additionalProperties": false
                    },
                    "strict": true
                }
            },
            "messages": [
                { "role": "system", "content": self.system_prompt },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": self.user_prompt(greetee) },
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/jpeg;base64,{image_b64}") }
                        }
                    ]
                }
            ]
        })
    }
}

impl DescriptionService for OpenAiDescriber {
    async fn describe(&self, person: RgbImage, greetee: &Greetee) -> Result<String, DescribeError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(DescribeError::NotConfigured);
        };

        let jpeg = encode_for_upload(&person, self.image_max_side)?;
        let b64 = base64::engine::general_purpose::STANDARD.encode(&jpeg);
        let payload = self.build_payload(&b64, greetee);

        tracing::debug!(greetee = ?greetee, image_bytes = jpeg.len(), "requesting description");

        let resp = self
            .http_client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DescribeError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DescribeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| DescribeError::Malformed(e.to_string()))?;
        parse_description(chat)
    }
}

fn parse_description(chat: ChatResponse) -> Result<String, DescribeError> {
    let content = chat
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| DescribeError::Malformed("response has no message content".into()))?;

    let parsed: Description = serde_json::from_str(&content)
        .map_err(|e| DescribeError::Malformed(format!("content is not the expected JSON: {e}")))?;
    Ok(parsed.description.trim().to_string())
}

/// Downscale so the longest side is at most `max_side`, then JPEG-encode.
fn encode_for_upload(image: &RgbImage, max_side: u32) -> Result<Vec<u8>, DescribeError> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    let mut out = Cursor::new(Vec::new());

    let written = if max_side > 0 && longest > max_side {
        let scale = max_side as f32 / longest as f32;
        let nw = ((w as f32 * scale).round() as u32).max(1);
        let nh = ((h as f32 * scale).round() as u32).max(1);
        imageops::resize(image, nw, nh, FilterType::Triangle).write_to(&mut out, ImageFormat::Jpeg)
    } else {
        image.write_to(&mut out, ImageFormat::Jpeg)
    };
    written.map_err(|e| DescribeError::Encode(e.to_string()))?;

    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describer(api_key: Option<&str>) -> OpenAiDescriber {
        let config = GreetingConfig {
            api_key: api_key.map(str::to_string),
            guest_prompt: "Describe the outfit.".into(),
            visitor_prompt: "Welcome {name}.".into(),
            ..GreetingConfig::default()
        };
        OpenAiDescriber::new(&config).unwrap()
    }

    #[test]
    fn test_payload_uses_strict_schema_and_data_url() {
        let d = describer(Some("k"));
        let payload = d.build_payload("AAAA", &Greetee::Guest);
        assert_eq!(payload["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            payload["response_format"]["json_schema"]["schema"]["required"][0],
            "description"
        );
        let user = &payload["messages"][1]["content"];
        assert_eq!(user[0]["text"], "Describe the outfit.");
        assert_eq!(user[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    }

    #[test]
    fn test_visitor_prompt_uses_first_name() {
        let d = describer(Some("k"));
        let greetee = Greetee::Visitor {
            name: "Grace Hopper".into(),
        };
        assert_eq!(d.user_prompt(&greetee), "Welcome Grace.");
    }

    #[test]
    fn test_parse_description() {
        let chat: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "{\"description\": \" Love the hat! \"}" } }]
        }))
        .unwrap();
        assert_eq!(parse_description(chat).unwrap(), "Love the hat!");
    }

    #[test]
    fn test_parse_description_rejects_plain_text() {
        let chat: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "Hello!" } }]
        }))
        .unwrap();
        assert!(matches!(parse_description(chat), Err(DescribeError::Malformed(_))));

        let empty: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(matches!(parse_description(empty), Err(DescribeError::Malformed(_))));
    }

    #[test]
    fn test_upload_is_downscaled() {
        let big = RgbImage::new(600, 2048);
        let jpeg = encode_for_upload(&big, 1024).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (300, 1024));

        let small = RgbImage::new(100, 200);
        let jpeg = encode_for_upload(&small, 1024).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 200));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let d = describer(None);
        let err = d.describe(RgbImage::new(4, 4), &Greetee::Guest).await.unwrap_err();
        assert!(matches!(err, DescribeError::NotConfigured));
    }
}
