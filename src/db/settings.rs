use super::models::{UserApiKey, UserSettings};
use super::{now_timestamp, Database, DbError, Result};
use rusqlite::{params, OptionalExtension};

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub default_model: Option<String>,
    pub default_persona_id: Option<String>,
    pub theme: Option<String>,
    /// Merged key by key into the stored preferences object.
    pub preferences: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Database {
    // ── API keys ──
    //
    // Keys arrive encrypted by the client and are stored as opaque blobs.

    pub fn list_api_keys(&self, user_id: &str) -> Result<Vec<UserApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider, encrypted_key, iv, created_at, updated_at FROM user_api_keys
             WHERE user_id = ?1 ORDER BY provider ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UserApiKey {
                provider: row.get(0)?,
                encrypted_key: row.get(1)?,
                iv: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn upsert_api_key(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_key: &str,
        iv: Option<&str>,
    ) -> Result<UserApiKey> {
        let conn = self.conn()?;
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO user_api_keys (user_id, provider, encrypted_key, iv, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (user_id, provider) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                iv = excluded.iv,
                updated_at = excluded.updated_at",
            params![user_id, provider, encrypted_key, iv, now],
        )?;
        conn.query_row(
            "SELECT provider, encrypted_key, iv, created_at, updated_at FROM user_api_keys
             WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
            |row| {
                Ok(UserApiKey {
                    provider: row.get(0)?,
                    encrypted_key: row.get(1)?,
                    iv: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .map_err(DbError::from)
    }

    pub fn delete_api_key(&self, user_id: &str, provider: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM user_api_keys WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("api key"));
        }
        Ok(())
    }

    // ── Settings ──

    /// Defaults when the user has never saved settings.
    pub fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT default_model, default_persona_id, theme, preferences, updated_at
                 FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match result {
            Some((default_model, default_persona_id, theme, preferences, updated_at)) => {
                Ok(UserSettings {
                    default_model,
                    default_persona_id,
                    theme,
                    preferences: serde_json::from_str(&preferences)
                        .map_err(|e| DbError::Invalid(e.to_string()))?,
                    updated_at: Some(updated_at),
                })
            }
            None => Ok(UserSettings {
                preferences: serde_json::Value::Object(Default::default()),
                ..Default::default()
            }),
        }
    }

    pub fn patch_settings(&self, user_id: &str, patch: SettingsPatch) -> Result<UserSettings> {
        let current = self.get_settings(user_id)?;

        let mut preferences = match current.preferences {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(changes) = patch.preferences {
            for (key, value) in changes {
                if value.is_null() {
                    preferences.remove(&key);
                } else {
                    preferences.insert(key, value);
                }
            }
        }
        let preferences = serde_json::Value::Object(preferences).to_string();

        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO user_settings (user_id, default_model, default_persona_id, theme, preferences, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id) DO UPDATE SET
                    default_model = excluded.default_model,
                    default_persona_id = excluded.default_persona_id,
                    theme = excluded.theme,
                    preferences = excluded.preferences,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    patch.default_model.or(current.default_model),
                    patch.default_persona_id.or(current.default_persona_id),
                    patch.theme.or(current.theme),
                    preferences,
                    now_timestamp()
                ],
            )?;
        }
        self.get_settings(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_key_upsert_replaces_blob() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_api_key("u1", "openai", "blob-1", Some("iv-1")).unwrap();
        let updated = db.upsert_api_key("u1", "openai", "blob-2", None).unwrap();
        assert_eq!(updated.encrypted_key, "blob-2");
        assert_eq!(updated.iv, None);

        let keys = db.list_api_keys("u1").unwrap();
        assert_eq!(keys.len(), 1);
        assert!(db.list_api_keys("u2").unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_api_key() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.delete_api_key("u1", "anthropic").unwrap_err(),
            DbError::NotFound("api key")
        ));
    }

    #[test]
    fn test_settings_default_then_merge() {
        let db = Database::open_in_memory().unwrap();
        let defaults = db.get_settings("u1").unwrap();
        assert_eq!(defaults.default_model, None);
        assert_eq!(defaults.preferences, json!({}));

        let prefs = json!({"font_size": 14, "send_on_enter": true});
        db.patch_settings(
            "u1",
            SettingsPatch {
                default_model: Some("openai/gpt-4o".into()),
                preferences: prefs.as_object().cloned(),
                ..Default::default()
            },
        )
        .unwrap();

        let patched = db
            .patch_settings(
                "u1",
                SettingsPatch {
                    theme: Some("dark".into()),
                    preferences: json!({"font_size": null, "lang": "en"}).as_object().cloned(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(patched.default_model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(patched.theme.as_deref(), Some("dark"));
        assert_eq!(patched.preferences, json!({"send_on_enter": true, "lang": "en"}));
    }
}
