//! Server rendered login, logout and error pages.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use stopnik_core::config::UiConfig;

use crate::validation::{
    FORM_AUTH_SESSION, FORM_LOGOUT_ALL, FORM_LOGOUT_REDIRECT, FORM_PASSWORD, FORM_USERNAME,
};

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(ui: &UiConfig, body: &str) -> String {
    let footer = if ui.hide_footer {
        String::new()
    } else {
        format!("<footer>{}</footer>", escape(&ui.footer_text))
    };
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n</head>\n<body>\n<main>\n<h1>{title}</h1>\n{body}\n</main>\n{footer}\n</body>\n</html>\n",
        title = escape(&ui.title),
    )
}

/// Login form posting back to `action` with the signed login token.
pub fn login(ui: &UiConfig, action: &str, login_token: &str, message: Option<&str>) -> Html<String> {
    let message = message
        .map(|m| format!("<p class=\"message\">{}</p>\n", escape(m)))
        .unwrap_or_default();
    let body = format!(
        "{message}<form method=\"POST\" action=\"{action}\">\n\
         <input type=\"hidden\" name=\"{FORM_AUTH_SESSION}\" value=\"{token}\">\n\
         <label>Username <input type=\"text\" name=\"{FORM_USERNAME}\" autocomplete=\"username\" required></label>\n\
         <label>Password <input type=\"password\" name=\"{FORM_PASSWORD}\" autocomplete=\"current-password\" required></label>\n\
         <button type=\"submit\">Login</button>\n</form>",
        action = escape(action),
        token = escape(login_token),
    );
    Html(layout(ui, &body))
}

/// Logout form for a logged-in user, returning to `redirect` afterwards.
pub fn logout(ui: &UiConfig, username: &str, redirect: &str) -> Html<String> {
    let body = format!(
        "<p>Logged in as <strong>{username}</strong></p>\n\
         <form method=\"POST\" action=\"/logout\">\n\
         <input type=\"hidden\" name=\"{FORM_LOGOUT_REDIRECT}\" value=\"{redirect}\">\n\
         <label><input type=\"checkbox\" name=\"{FORM_LOGOUT_ALL}\"> Logout everywhere</label>\n\
         <button type=\"submit\">Logout</button>\n</form>",
        username = escape(username),
        redirect = escape(redirect),
    );
    Html(layout(ui, &body))
}

pub fn error(ui: &UiConfig, status: StatusCode, message: &str) -> Response {
    let body = format!("<p class=\"error\">{}</p>", escape(message));
    (status, Html(layout(ui, &body))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_is_escaped() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");

        let ui = UiConfig::default();
        let page = login(&ui, "/authorize?a=1&b=2", "tok", Some("<b>bad</b>")).0;
        assert!(page.contains("action=\"/authorize?a=1&amp;b=2\""));
        assert!(page.contains("&lt;b&gt;bad&lt;/b&gt;"));
        assert!(page.contains("name=\"stopnik_auth_session\" value=\"tok\""));
    }

    #[test]
    fn footer_can_be_hidden() {
        let mut ui = UiConfig::default();
        ui.footer_text = "STOPnik".to_string();
        assert!(logout(&ui, "foo", "/account").0.contains("<footer>STOPnik</footer>"));
        ui.hide_footer = true;
        assert!(!logout(&ui, "foo", "/account").0.contains("<footer>"));
    }
}
