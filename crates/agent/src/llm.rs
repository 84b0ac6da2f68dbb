//! LLM gateway abstraction and OpenAI/Azure-compatible implementation.

use async_openai::{
    Client,
    config::{AzureConfig, OpenAIConfig},
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolChoiceOption, ChatCompletionToolType,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FinishReason, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use proto::{FunctionCall, LlmError, Message, Role, ToolCall, ToolCallKind, ToolDefinition};
use tracing::debug;

/// Request to the LLM
#[derive(Debug)]
pub struct ChatRequest {
    /// Full history including the system prompt.
    pub messages: Vec<Message>,
    /// Flattened, allow-listed tools offered to the model.
    pub tools: Vec<ToolDefinition>,
    /// Target model or deployment id.
    pub model: String,
}

/// Token usage reported by the LLM for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of tokens in the prompt / input.
    pub prompt_tokens: u32,
    /// Number of tokens in the generated output.
    pub completion_tokens: u32,
    /// Provider-reported total.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One model turn: the assistant message exactly as returned, plus usage.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: Message,
    pub usage: TokenUsage,
}

/// LLM gateway trait
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Sends the history and tool list; fails with [`LlmError::ContentFiltered`]
    /// when the provider refuses on content-policy grounds.
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion, LlmError>;
}

enum GatewayClient {
    OpenAi(Client<OpenAIConfig>),
    Azure(Client<AzureConfig>),
}

/// Chat-completions gateway for OpenAI-compatible endpoints and Azure OpenAI.
pub struct OpenAiGateway {
    client: GatewayClient,
}

impl OpenAiGateway {
    /// Creates a gateway using the default OpenAI API base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: GatewayClient::OpenAi(Client::with_config(config)),
        }
    }

    /// Creates a gateway for an OpenAI-compatible endpoint at `base_url`.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: GatewayClient::OpenAi(Client::with_config(config)),
        }
    }

    /// Creates a gateway for an Azure OpenAI deployment.
    pub fn azure(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        let config = AzureConfig::new()
            .with_api_key(api_key)
            .with_api_base(endpoint)
            .with_deployment_id(deployment)
            .with_api_version(api_version);
        Self {
            client: GatewayClient::Azure(Client::with_config(config)),
        }
    }

    async fn create(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, OpenAIError> {
        match &self.client {
            GatewayClient::OpenAi(client) => client.chat().create(request).await,
            GatewayClient::Azure(client) => client.chat().create(request).await,
        }
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion, LlmError> {
        let request = build_request(&req)?;

        debug!(
            model = %req.model,
            messages = %req.messages.len(),
            tools = %req.tools.len(),
            "Sending chat completion request"
        );

        let response = self.create(request).await.map_err(map_api_error)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".into()))?;

        if matches!(choice.finish_reason, Some(FinishReason::ContentFilter)) {
            return Err(LlmError::ContentFiltered(
                "response stopped by content filter".to_string(),
            ));
        }

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                },
            })
            .collect();

        let message = if tool_calls.is_empty() {
            Message {
                role: Role::Assistant,
                content: choice.message.content,
                tool_calls: None,
                tool_call_id: None,
            }
        } else {
            Message::assistant_tool_calls(choice.message.content, tool_calls)
        };
        Ok(ChatCompletion { message, usage })
    }
}

/// Builds the chat-completions request: automatic tool choice, one tool call per turn.
fn build_request(req: &ChatRequest) -> Result<CreateChatCompletionRequest, LlmError> {
    let messages: Vec<ChatCompletionRequestMessage> = req
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<_, _>>()?;

    let tools: Vec<ChatCompletionTool> = req
        .tools
        .iter()
        .map(convert_tool)
        .collect::<Result<_, _>>()?;

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder.model(&req.model).messages(messages);

    if !tools.is_empty() {
        builder
            .tools(tools)
            .tool_choice(ChatCompletionToolChoiceOption::Auto)
            .parallel_tool_calls(false);
    }

    builder
        .build()
        .map_err(|e| LlmError::Serialization(e.to_string()))
}

/// Classifies provider errors; content-policy refusals get their own variant.
fn map_api_error(err: OpenAIError) -> LlmError {
    if let OpenAIError::ApiError(api) = &err
        && is_content_filter_code(api.code.as_deref())
    {
        debug!(error = %api.message, "Request rejected by content filter");
        return LlmError::ContentFiltered(api.message.clone());
    }
    let msg = err.to_string();
    debug!(error = %msg, "Chat completion API error");
    LlmError::Api(msg)
}

fn is_content_filter_code(code: Option<&str>) -> bool {
    matches!(code, Some("content_filter" | "content_policy_violation"))
}

/// Converts a history message into the request format.
fn convert_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
    let content = m.content.clone().unwrap_or_default();
    match m.role {
        Role::System => Ok(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        )),
        Role::User => Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        )),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(text) = &m.content {
                builder.content(text.clone());
            }

            let calls = m.requested_tool_calls();
            if !calls.is_empty() {
                let tc: Vec<ChatCompletionMessageToolCall> = calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: async_openai::types::FunctionCall {
                            name: tc.function.name.clone(),
                            arguments: tc.function.arguments.clone(),
                        },
                    })
                    .collect();
                builder.tool_calls(tc);
            }

            Ok(ChatCompletionRequestMessage::Assistant(
                builder
                    .build()
                    .map_err(|e| LlmError::Serialization(e.to_string()))?,
            ))
        }
        Role::Tool => {
            let call_id = m
                .tool_call_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(content)
                    .build()
                    .map_err(|e| LlmError::Serialization(e.to_string()))?,
            ))
        }
    }
}

/// Converts a tool schema into a function-tool declaration.
fn convert_tool(t: &ToolDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.parameters.clone())
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}
