use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::server::{SuggestOpenApi, SUGGEST_PATH};

pub const SWAGGER_UI_PATH: &str = "/swagger-ui";
pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";

#[derive(OpenApi)]
#[openapi(
    paths(crate::server::root, crate::server::health),
    nest(
        (path = SUGGEST_PATH, api = SuggestOpenApi),
    ),
    tags(
        (name = "health", description = "Liveness and engine state"),
        (name = "suggest", description = "Code suggestions"),
    ),
    servers(
        (url = "http://localhost:5000"),
    )
)]
pub struct ApiDoc;

/// The OpenAPI document, rendered as YAML
pub fn openapi_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&ApiDoc::openapi())
}

pub fn openapi_routes() -> Router {
    Router::new().merge(SwaggerUi::new(SWAGGER_UI_PATH).url(OPENAPI_JSON_PATH, ApiDoc::openapi()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{HEALTH_PATH, ROOT_PATH};

    #[test]
    fn test_openapi_document() {
        let yaml = openapi_yaml().unwrap();
        assert!(yaml.contains(SUGGEST_PATH));
        assert!(yaml.contains("GenerationResult"));

        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key(SUGGEST_PATH));
        assert!(doc.paths.paths.contains_key(HEALTH_PATH));
        assert!(doc.paths.paths.contains_key(ROOT_PATH));
    }
}
