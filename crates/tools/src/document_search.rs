//! Retrieve-then-summarize tools over a document corpus.
//!
//! The top passages for the input are stuffed into a role-specific prompt
//! and sent to the language model without tools. The model's text is the
//! tool result.

use std::sync::Arc;

use async_trait::async_trait;
use routeqa_core::error::ToolError;
use routeqa_core::tool::{Tool, query_schema};
use routeqa_core::{DocumentStore, Message, Passage, Provider, ProviderRequest};
use tracing::debug;

/// Which analyst persona summarizes the passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Product,
    Feedback,
}

/// A document-search tool bound to one corpus.
pub struct DocumentSearchTool {
    name: String,
    description: String,
    instructions: String,
    empty_answer: String,
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    top_k: usize,
}

impl DocumentSearchTool {
    /// `product_details_search` over brochure passages.
    pub fn product(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        product_name: &str,
    ) -> Self {
        Self::new(SearchKind::Product, store, provider, model, product_name)
    }

    /// `customer_feedback_search` over feedback passages.
    pub fn feedback(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        product_name: &str,
    ) -> Self {
        Self::new(SearchKind::Feedback, store, provider, model, product_name)
    }

    pub fn new(
        kind: SearchKind,
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        product_name: &str,
    ) -> Self {
        let (name, description, instructions, empty_answer) = match kind {
            SearchKind::Product => (
                "product_details_search",
                format!(
                    "Use this tool to find technical specifications, features, or details about \
                     the {product_name}. This includes information on range, charging, \
                     performance, interior features, driver assistance, and sustainability."
                ),
                format!(
                    "You are a {product_name} Product Specialist. Your goal is to answer technical \
                     and feature-related questions about the {product_name} based *only* on the \
                     provided context from the product brochure.\n\n\
                     - Be precise and factual.\n\
                     - Answer only with information found in the context.\n\
                     - If the answer is not in the context, state clearly: \"I do not have that \
                     specific information in the product brochure.\""
                ),
                "I do not have that specific information in the product brochure.",
            ),
            SearchKind::Feedback => (
                "customer_feedback_search",
                format!(
                    "Use this tool to search for customer feedback, opinions, complaints, or \
                     sentiments about the {product_name}, its features (e.g., charging, range), \
                     or the dealership experience. Input should be a specific topic to search for."
                ),
                format!(
                    "You are a helpful assistant for the {product_name}. Your task is to find and \
                     summarize customer feedback. Answer the user's question based *only* on the \
                     following feedback documents. For each piece of feedback you use, you MUST \
                     cite the 'Source', 'User ID', and 'Sentiment'.\n\n\
                     If the query is general (e.g., \"what do people think?\"), try to find both \
                     positive and negative themes.\n\
                     If no relevant feedback is found, just say \"I could not find any customer \
                     feedback on that topic.\""
                ),
                "I could not find any customer feedback on that topic.",
            ),
        };

        Self {
            name: name.into(),
            description,
            instructions,
            empty_answer: empty_answer.into(),
            store,
            provider,
            model: model.into(),
            temperature: 0.0,
            top_k: 5,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The reply used when retrieval finds nothing.
    pub fn empty_answer(&self) -> &str {
        &self.empty_answer
    }

    fn build_prompt(&self, question: &str, passages: &[Passage]) -> Vec<Message> {
        let context = passages
            .iter()
            .map(render_passage)
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        vec![
            Message::system(self.instructions.clone()),
            Message::user(format!(
                "CONTEXT:\n{context}\n\nQUESTION:\n{question}\n\nANSWER:"
            )),
        ]
    }
}

/// `user_id` → `User ID`, `sentiment` → `Sentiment`.
fn label(key: &str) -> String {
    key.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            if w.eq_ignore_ascii_case("id") {
                return "ID".to_string();
            }
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_passage(passage: &Passage) -> String {
    let mut header = Vec::new();
    if let Some(source) = &passage.source {
        header.push(format!("Source: {source}"));
    }
    for (key, value) in &passage.metadata {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        header.push(format!("{}: {value}", label(key)));
    }
    if header.is_empty() {
        passage.content.clone()
    } else {
        format!("{}\n{}", header.join("\n"), passage.content)
    }
}

#[async_trait]
impl Tool for DocumentSearchTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("The topic or question to search for")
    }

    async fn invoke(&self, input: &str) -> Result<String, ToolError> {
        let passages = self
            .store
            .search(input, self.top_k)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })?;

        debug!(tool = %self.name, corpus = self.store.name(), hits = passages.len(), "Passages retrieved");
        if passages.is_empty() {
            return Ok(self.empty_answer.clone());
        }

        let request = ProviderRequest::text(
            self.model.clone(),
            self.build_prompt(input, &passages),
            self.temperature,
        );
        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(response.message.content)
    }
}
