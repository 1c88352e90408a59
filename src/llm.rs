use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CompletionsRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompletionsResponse {
    pub choices: Vec<Choice>,
}

pub async fn completion(
    client: &reqwest::Client,
    auth_token: &str,
    request: CompletionsRequest,
) -> Result<CompletionsResponse> {
    let response = client
        .post(COMPLETIONS_URL)
        .bearer_auth(auth_token)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response)
}
