mod common;

use common::{account, registry};
use kite_relay::accounts::{AccountStore, AccountUpdate, NewAccount};
use kite_relay::domain::errors::AccountError;

#[tokio::test]
async fn primary_is_first_enabled_credentialed_account() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = vec![
        account("a", "key-a", "tok-a", false),
        account("b", "key-b", "", true),
        account("c", "key-c", "tok-c", true),
        account("d", "key-d", "tok-d", true),
    ];
    let (registry, _) = registry(&dir.path().join("accounts.json"), &accounts).await;

    let primary = registry.primary_account().await.unwrap();
    assert_eq!(primary.id, "c");
    assert_eq!(primary.access_token, "tok-c");

    let enabled: Vec<String> = registry.enabled_accounts().await.into_iter().map(|h| h.id).collect();
    assert_eq!(enabled, vec!["c", "d"]);
}

#[tokio::test]
async fn no_credentials_means_no_primary() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir.path().join("accounts.json"), &[account("a", "key-a", "", true)]).await;
    assert!(registry.primary_account().await.is_none());
    assert!(registry.enabled_accounts().await.is_empty());
    assert_eq!(registry.accounts().await.len(), 1);
}

#[tokio::test]
async fn mutations_are_durable_and_visible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let (registry, _) = registry(&path, &[]).await;

    let added = registry
        .add_account(NewAccount {
            name: Some("Desk".to_string()),
            api_key: Some("key-new".to_string()),
            api_secret: Some("s".to_string()),
            access_token: Some("tok".to_string()),
        })
        .await
        .unwrap();
    assert!(added.id.starts_with("acc_"));
    assert!(added.has_credentials);
    assert_eq!(registry.enabled_accounts().await.len(), 1);

    registry
        .update_account(
            &added.id,
            AccountUpdate {
                enabled: Some(false),
                api_secret: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(registry.enabled_accounts().await.is_empty());

    let on_disk = AccountStore::new(&path).try_load().unwrap();
    assert_eq!(on_disk.len(), 1);
    assert!(!on_disk[0].enabled);
    assert_eq!(on_disk[0].api_secret, "s");

    registry.delete_account(&added.id).await.unwrap();
    assert!(registry.accounts().await.is_empty());
    assert!(matches!(
        registry.delete_account(&added.id).await,
        Err(AccountError::NotFound(_))
    ));
}

#[tokio::test]
async fn token_update_on_primary_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = vec![
        account("a", "key-a", "old", true),
        account("b", "key-b", "old", true),
    ];
    let (registry, _) = registry(&dir.path().join("accounts.json"), &accounts).await;
    let mut primary = registry.subscribe_primary();
    primary.borrow_and_update();

    // Not the primary: nothing published
    registry.update_access_token_by_api_key("key-b", "new-b").await.unwrap();
    assert!(!primary.has_changed().unwrap());

    let view = registry.update_access_token_by_api_key("key-a", "new-a").await.unwrap();
    assert!(view.last_token_update.is_some());
    assert!(primary.has_changed().unwrap());
    assert_eq!(primary.borrow_and_update().as_ref().unwrap().access_token, "new-a");

    assert!(matches!(
        registry.update_access_token_by_api_key("nope", "x").await,
        Err(AccountError::ApiKeyNotFound(_))
    ));
}

#[tokio::test]
async fn complete_login_exchanges_and_stores_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut no_secret = account("b", "key-b", "", true);
    no_secret.api_secret.clear();
    let accounts = vec![account("a", "key-a", "", true), no_secret];
    let (registry, _) = registry(&dir.path().join("accounts.json"), &accounts).await;
    assert!(registry.primary_account().await.is_none());

    let view = registry.complete_login("key-a", "req1").await.unwrap();
    assert!(view.has_credentials);
    assert_eq!(registry.primary_account().await.unwrap().access_token, "token-req1");

    assert!(matches!(
        registry.complete_login("key-b", "req2").await,
        Err(AccountError::MissingApiSecret(_))
    ));
    assert!(matches!(
        registry.complete_login("key-a", "expired").await,
        Err(AccountError::TokenExchange(_))
    ));
    assert!(matches!(
        registry.complete_login("key-z", "req3").await,
        Err(AccountError::ApiKeyNotFound(_))
    ));
}

#[tokio::test]
async fn corrupt_file_is_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let (registry, _) = registry(&path, &[account("a", "key-a", "tok", true)]).await;

    std::fs::write(&path, "{ half written").unwrap();
    let result = registry.update_access_token_by_api_key("key-a", "fresh").await;
    assert!(matches!(result, Err(AccountError::Persist(_))));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ half written");

    // In-memory view is unchanged
    assert_eq!(registry.primary_account().await.unwrap().access_token, "tok");
}

#[tokio::test]
async fn reload_picks_up_manual_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let (registry, _) = registry(&path, &[account("a", "key-a", "tok", true)]).await;

    AccountStore::new(&path)
        .save(&[
            account("a", "key-a", "tok", true),
            account("b", "key-b", "tok", true),
        ])
        .unwrap();
    assert_eq!(registry.reload().await, 2);
    assert_eq!(registry.enabled_accounts().await.len(), 2);
}
