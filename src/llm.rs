//! # Model invocation
//!
//! Resolves a model name to its provider settings and builds an OpenAI compatible
//! chat client bound to them.
//!
//! - [`get_chat_model`] merges the provider's settings with per-request overrides
//!   (temperature, token ceiling, streaming) into a [`ChatModel`].
//! - [`ChatModel::stream`] yields content deltas in the order the provider sends them.
//! - [`ChatModel::invoke`] returns the whole answer at once.
//!
//! This layer does not validate the provider settings. An unconfigured key simply
//! reaches the provider empty, and the provider's rejection surfaces as an [`LlmError`].
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use llm_relay::config::RelayConfig;
//! use llm_relay::llm::get_chat_model;
//!
//! # async fn demo() -> Result<(), llm_relay::llm::LlmError> {
//! let config = RelayConfig::default();
//! let model = get_chat_model(&config, "gpt-3.5-turbo", Some(0.0), None, true)?;
//! let mut tokens = model.stream("Say hi".to_string(), &[]).await?;
//! while let Some(token) = tokens.next().await {
//!     print!("{}", token?);
//! }
//! # Ok(()) }
//! ```
use crate::config::{ProviderConfig, RelayConfig};
use crate::template::History;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionResponseStream, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs,
    },
};
use futures::{Stream, StreamExt, stream::BoxStream};
use thiserror::Error;
use tracing::{debug, error};

/// Failures talking to the provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Provider(#[from] OpenAIError),

    #[error("invalid proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A chat client bound to one provider and one set of sampling parameters.
#[derive(Clone)]
pub struct ChatModel {
    client: Client<OpenAIConfig>,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub streaming: bool,
}

impl std::fmt::Debug for ChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModel")
            .field("model_name", &self.model_name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// Creates a new OpenAI API client from provider settings.
///
/// An absent key is sent as an empty string; a configured proxy routes every
/// request to this provider through it.
fn create_client(provider: &ProviderConfig) -> Result<Client<OpenAIConfig>, LlmError> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(provider.api_key.clone().unwrap_or_default())
        .with_api_base(provider.api_base_url.clone());
    debug!(api_base = %provider.api_base_url, "client created");

    let client = Client::with_config(openai_config);
    match provider.openai_proxy.as_deref().filter(|p| !p.is_empty()) {
        Some(proxy) => {
            let http_client = reqwest::Proxy::all(proxy)
                .and_then(|p| reqwest::Client::builder().proxy(p).build())
                .map_err(|source| LlmError::Proxy {
                    proxy: proxy.to_string(),
                    source,
                })?;
            Ok(client.with_http_client(http_client))
        }
        None => Ok(client),
    }
}

/// Resolve `model_name` and build a [`ChatModel`].
///
/// Caller overrides win over the provider's defaults, which win over the global
/// defaults in [`RelayConfig`]. When no provider is configured at all, the client
/// points at the default OpenAI endpoint with no key.
pub fn get_chat_model(
    config: &RelayConfig,
    model_name: &str,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    streaming: bool,
) -> Result<ChatModel, LlmError> {
    let provider = config.model_config(model_name).cloned().unwrap_or_else(|| {
        error!(model = %model_name, "no provider configured; using defaults");
        ProviderConfig {
            model_name: model_name.to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            openai_proxy: None,
            temperature: None,
            max_tokens: None,
        }
    });

    let client = create_client(&provider)?;

    Ok(ChatModel {
        client,
        model_name: provider.model_name,
        temperature: temperature
            .or(provider.temperature)
            .unwrap_or(config.temperature),
        max_tokens: max_tokens.or(provider.max_tokens).or(config.max_tokens),
        streaming,
    })
}

/// Turn prior turns plus the rendered prompt into provider messages.
pub fn build_messages(
    prompt: String,
    history: &[History],
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    for turn in history {
        let message: ChatCompletionRequestMessage = match turn.role.as_str() {
            "assistant" | "ai" => ChatCompletionRequestAssistantMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into(),
            "system" => ChatCompletionRequestSystemMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into(),
            _ => ChatCompletionRequestUserMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into(),
        };
        messages.push(message);
    }
    messages.push(
        ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()?
            .into(),
    );
    Ok(messages)
}

impl ChatModel {
    #[allow(deprecated)]
    fn request(
        &self,
        prompt: String,
        history: &[History],
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model_name.clone())
            .temperature(self.temperature)
            .stream(stream)
            .messages(build_messages(prompt, history)?);
        if let Some(max_tokens) = self.max_tokens {
            args.max_tokens(max_tokens);
        }
        args.build()
    }

    /// Stream the answer to `prompt` as content deltas.
    ///
    /// Deltas arrive in provider order; choices without content are skipped.
    pub async fn stream(
        &self,
        prompt: String,
        history: &[History],
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let request = self.request(prompt, history, true)?;
        debug!("Sending request: {:?}", request);

        let stream = self.client.chat().create_stream(request).await?;
        Ok(content_deltas(stream).boxed())
    }

    /// Fetch the whole answer to `prompt` in one request.
    pub async fn invoke(&self, prompt: String, history: &[History]) -> Result<String, LlmError> {
        let request = self.request(prompt, history, false)?;
        debug!("Sending request: {:?}", request);

        let response = self.client.chat().create(request).await?;
        let mut response_string = String::new();
        response.choices.iter().for_each(|chat_choice| {
            if let Some(ref content) = chat_choice.message.content {
                response_string.push_str(content);
            }
        });
        Ok(response_string)
    }
}

fn content_deltas(
    stream: ChatCompletionResponseStream,
) -> impl Stream<Item = Result<String, LlmError>> {
    stream.filter_map(|result| async move {
        match result {
            Ok(response) => {
                let text: String = response
                    .choices
                    .iter()
                    .filter_map(|choice| choice.delta.content.as_deref())
                    .collect();
                (!text.is_empty()).then_some(Ok(text))
            }
            Err(err) => {
                error!("Received error: {}", err);
                Some(Err(LlmError::from(err)))
            }
        }
    })
}
