//! Minimal HTML form over the same generation path as `POST /generate`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Form,
};
use minijinja::{context, Environment};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{api::types::GenerateRequest, error::AppError, state::AppState};

const TEMPLATE_NAME: &str = "playground.html";

const TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>Text generation</title>
</head>
<body>
  <h1>Text generation</h1>
  <p>Model: {{ model }}</p>
  <form method="post" action="/playground">
    <p><textarea name="prompt" rows="4" cols="60">{{ form.prompt }}</textarea></p>
    <p>
      <label>max_length <input name="max_length" value="{{ form.max_length }}" placeholder="{{ defaults.max_length }}"></label>
      <label>temperature <input name="temperature" value="{{ form.temperature }}" placeholder="{{ defaults.temperature }}"></label>
      <label>top_p <input name="top_p" value="{{ form.top_p }}" placeholder="{{ defaults.top_p }}"></label>
    </p>
    <p><button type="submit">Generate</button></p>
  </form>
  {% if error %}<p class="error">{{ error }}</p>{% endif %}
  {% if generated_text %}<h2>Result</h2><pre>{{ generated_text }}</pre>{% endif %}
</body>
</html>
"#;

static TEMPLATES: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    if let Err(err) = env.add_template(TEMPLATE_NAME, TEMPLATE) {
        error!(error = %err, "failed to compile playground template");
    }
    env
});

/// Raw form fields. Numeric inputs arrive as text and may be blank.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PlaygroundForm {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub max_length: String,
    #[serde(default)]
    pub temperature: String,
    #[serde(default)]
    pub top_p: String,
}

impl PlaygroundForm {
    fn to_request(&self) -> Result<GenerateRequest, AppError> {
        Ok(GenerateRequest {
            prompt: self.prompt.clone(),
            max_length: parse_field("max_length", &self.max_length)?,
            temperature: parse_field("temperature", &self.temperature)?,
            top_p: parse_field("top_p", &self.top_p)?,
            seed: None,
        })
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| AppError::InvalidBody(format!("{name}: {e}")))
}

pub async fn show(State(state): State<AppState>) -> Response {
    render(&state, StatusCode::OK, &PlaygroundForm::default(), None, None)
}

pub async fn submit(State(state): State<AppState>, Form(form): Form<PlaygroundForm>) -> Response {
    let outcome = match form.to_request() {
        Ok(req) => state.service.generate(req).await,
        Err(err) => Err(err),
    };

    match outcome {
        Ok(record) => render(
            &state,
            StatusCode::OK,
            &form,
            Some(&record.generated_text),
            None,
        ),
        Err(err) => render(&state, err.status(), &form, None, Some(&err.to_string())),
    }
}

fn render(
    state: &AppState,
    status: StatusCode,
    form: &PlaygroundForm,
    generated_text: Option<&str>,
    error_message: Option<&str>,
) -> Response {
    let defaults = state.service.defaults();
    let page = TEMPLATES.get_template(TEMPLATE_NAME).and_then(|tmpl| {
        tmpl.render(context! {
            model => state.service.model_name(),
            form => form,
            defaults => context! {
                max_length => defaults.max_length,
                temperature => defaults.temperature,
                top_p => defaults.top_p,
            },
            generated_text => generated_text,
            error => error_message,
        })
    });

    match page {
        Ok(html) => (status, Html(html)).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render playground");
            (StatusCode::INTERNAL_SERVER_ERROR, "template error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_numeric_fields_mean_default() {
        let form = PlaygroundForm {
            prompt: "hi".into(),
            ..Default::default()
        };
        let req = form.to_request().unwrap();
        assert_eq!(req.prompt, "hi");
        assert!(req.max_length.is_none());
        assert!(req.temperature.is_none());
        assert!(req.top_p.is_none());
    }

    #[test]
    fn numeric_fields_are_parsed() {
        let form = PlaygroundForm {
            prompt: "hi".into(),
            max_length: " 64 ".into(),
            temperature: "0.7".into(),
            top_p: "0.9".into(),
        };
        let req = form.to_request().unwrap();
        assert_eq!(req.max_length, Some(64));
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.top_p, Some(0.9));
    }

    #[test]
    fn garbage_numeric_field_is_invalid_body() {
        let form = PlaygroundForm {
            prompt: "hi".into(),
            temperature: "warm".into(),
            ..Default::default()
        };
        let err = form.to_request().unwrap_err();
        assert!(matches!(err, AppError::InvalidBody(ref msg) if msg.starts_with("temperature")));
    }

    #[test]
    fn template_escapes_user_text() {
        let tmpl = TEMPLATES.get_template(TEMPLATE_NAME).unwrap();
        let html = tmpl
            .render(context! {
                model => "echo",
                form => PlaygroundForm::default(),
                defaults => context! { max_length => 50, temperature => 1.0, top_p => 1.0 },
                generated_text => "<script>alert(1)</script>",
                error => Option::<&str>::None,
            })
            .unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }
}
