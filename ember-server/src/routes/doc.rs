//! OpenAPI document aggregation for the Swagger UI.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ember Broker API",
        description = "OpenAI-compatible inference marketplace: consumer endpoints under /v1, account and marketplace endpoints under /api."
    ),
    tags(
        (name = "chat", description = "Chat completions"),
        (name = "embeddings", description = "Embeddings"),
        (name = "models", description = "Model listing"),
        (name = "market", description = "Marketplace views"),
    )
)]
struct BaseApi;

/// Merge every route group's spec into one document.
pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut docs = BaseApi::openapi();
    docs.merge(super::v1::chat::ChatApi::openapi());
    docs.merge(super::v1::embeddings::EmbeddingsApi::openapi());
    docs.merge(super::v1::models::ModelsApi::openapi());
    docs.merge(super::api::market::MarketApi::openapi());
    docs
}
