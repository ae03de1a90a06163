//! Admin surface cases, including the two that write to the subject's
//! config.

use livesuite_common::sse::value_text;
use serde_json::{Value, json};

use super::{
    CHAT_PATH, QUEUE_STATUS_PATH, Suite, TARGET_ACCOUNT_HEADER, body_detail, chat_body,
};
use crate::engine::{CaseContext, CaseError, RequestSpec};

const CONFIG_PATH: &str = "/admin/config";

pub(super) async fn login_verify(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let login = ctx
        .execute(&RequestSpec::post(
            "/admin/login",
            json!({"admin_key": suite.admin_key, "expire_hours": 24}),
        ))
        .await?;
    ctx.assert_status("login_status_200", &login, 200);

    let token = value_text(&login.json()["token"]);
    ctx.assert("token_exists", !token.is_empty(), body_detail(&login));
    if token.is_empty() {
        return Ok(());
    }

    let verify = ctx
        .execute(&RequestSpec::get("/admin/verify").bearer(&token))
        .await?;
    ctx.assert_status("verify_status_200", &verify, 200);
    ctx.assert(
        "verify_valid_true",
        verify.json()["valid"].as_bool().unwrap_or(false),
        body_detail(&verify),
    );
    Ok(())
}

pub(super) async fn queue_status(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let resp = ctx
        .execute(&suite.admin(RequestSpec::get(QUEUE_STATUS_PATH)))
        .await?;
    ctx.assert_status("status_200", &resp, 200);
    let m = resp.json();
    ctx.assert(
        "has_recommended_concurrency",
        m.get("recommended_concurrency").is_some(),
        body_detail(&resp),
    );
    ctx.assert("has_max_queue_size", m.get("max_queue_size").is_some(), body_detail(&resp));
    Ok(())
}

pub(super) async fn account_test(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let Some(identifier) = suite.account_id() else {
        ctx.assert("account_present", false, "no account in config");
        return Ok(());
    };
    let spec = suite.admin(RequestSpec::post(
        "/admin/accounts/test",
        json!({"identifier": identifier, "model": "deepseek-chat", "message": "ping"}),
    ));
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);
    ctx.assert(
        "success_true",
        resp.json()["success"].as_bool().unwrap_or(false),
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn unauthorized(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let resp = ctx.execute(&RequestSpec::get(CONFIG_PATH)).await?;
    ctx.assert_status("status_401", &resp, 401);
    Ok(())
}

/// Add and remove a throwaway key through the admin API, then confirm the
/// original config file never changed.
pub(super) async fn config_write_isolated(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let key = format!("testsuite-temp-{}", suite.run_tag());

    let add = ctx
        .execute(&suite.admin(RequestSpec::post("/admin/keys", json!({"key": key}))))
        .await?;
    ctx.assert_status("add_key_status_200", &add, 200);

    let after_add = ctx.execute(&suite.admin(RequestSpec::get(CONFIG_PATH))).await?;
    ctx.assert(
        "key_present_in_isolated_config",
        after_add.text().contains(&key),
        "added key not found in isolated config",
    );

    let delete_path = format!("/admin/keys/{}", urlencoding::encode(&key));
    let delete = ctx
        .execute(&suite.admin(RequestSpec::delete(delete_path)))
        .await?;
    ctx.assert_status("delete_key_status_200", &delete, 200);

    let after_delete = ctx.execute(&suite.admin(RequestSpec::get(CONFIG_PATH))).await?;
    ctx.assert(
        "key_removed_in_isolated_config",
        !after_delete.text().contains(&key),
        "temporary key still present",
    );

    match suite.isolated.verify_untouched() {
        Ok(()) => ctx.assert("original_config_unchanged", true, ""),
        Err(e) => ctx.assert("original_config_unchanged", false, e.to_string()),
    }
    Ok(())
}

/// Plant an invalid token on the first account and check that a chat
/// routed to it forces a refresh.
pub(super) async fn token_refresh(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let snapshot = &suite.isolated.snapshot;
    let Some(account) = snapshot.accounts.first() else {
        ctx.assert("account_present", false, "no account in config");
        return Ok(());
    };
    let Some(identifier) = account.identifier() else {
        ctx.assert("account_identifier", false, "first account has no identifier");
        return Ok(());
    };
    if account.password.trim().is_empty() {
        suite.warn("token refresh edge case skipped strict check: first account password empty");
        ctx.assert(
            "account_password_present",
            true,
            "skipped strict refresh check due empty password",
        );
        return Ok(());
    }

    let invalid_token = format!("invalid-testsuite-refresh-token-{}", suite.run_tag());
    let update = json!({
        "keys": snapshot.keys,
        "accounts": [{
            "email": account.email,
            "mobile": account.mobile,
            "password": account.password,
            "token": invalid_token,
        }],
    });
    let updated = ctx
        .execute(&suite.admin(RequestSpec::post(CONFIG_PATH, update)))
        .await?;
    ctx.assert_status("update_config_status_200", &updated, 200);

    let chat = suite
        .api(RequestSpec::post(
            CHAT_PATH,
            chat_body("deepseek-chat", "token refresh test", false),
        ))
        .header(TARGET_ACCOUNT_HEADER, identifier);
    let chat = ctx.execute(&chat).await?;
    ctx.assert(
        "chat_status_200",
        chat.status == 200,
        format!("status={} body={}", chat.status, chat.text()),
    );

    let config = ctx.execute(&suite.admin(RequestSpec::get(CONFIG_PATH))).await?;
    let (has_token, preview) = token_state(&config.json(), &account.email, &account.mobile);
    ctx.assert(
        "has_token_after_refresh",
        has_token,
        format!("config={}", config.text()),
    );

    let invalid_prefix: String = invalid_token.chars().take(20).collect();
    ctx.assert(
        "token_preview_changed_from_invalid",
        !preview.starts_with(&invalid_prefix),
        format!("preview={preview} invalid_prefix={invalid_prefix}"),
    );
    Ok(())
}

/// `(has_token, token_preview)` of the account matching both email and
/// mobile in an admin config listing.
fn token_state(config: &Value, email: &str, mobile: &str) -> (bool, String) {
    config["accounts"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|item| {
            value_text(&item["email"]) == email.trim() && value_text(&item["mobile"]) == mobile.trim()
        })
        .map(|item| {
            (
                item["has_token"].as_bool().unwrap_or(false),
                value_text(&item["token_preview"]),
            )
        })
        .unwrap_or_default()
}
