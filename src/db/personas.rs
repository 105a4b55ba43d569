use super::models::{Persona, PersonaMemory};
use super::{new_id, now_timestamp, Database, DbError, Result};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Default)]
pub struct NewPersona {
    pub name: String,
    pub system_prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PersonaUpdate {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub is_default: Option<bool>,
}

fn find_owned(conn: &Connection, user_id: &str, id: &str) -> Result<Option<Persona>> {
    let sql = format!(
        "SELECT {} FROM personas WHERE id = ?1 AND user_id = ?2",
        Persona::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, user_id], Persona::from_row)
        .optional()?)
}

fn get_owned(conn: &Connection, user_id: &str, id: &str) -> Result<Persona> {
    find_owned(conn, user_id, id)?.ok_or(DbError::NotFound("persona"))
}

fn clear_default(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE personas SET is_default = 0 WHERE user_id = ?1",
        params![user_id],
    )?;
    Ok(())
}

impl Database {
    // ── Personas ──

    pub fn list_personas(&self, user_id: &str) -> Result<Vec<Persona>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM personas WHERE user_id = ?1 ORDER BY is_default DESC, name ASC",
            Persona::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], Persona::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_persona(&self, user_id: &str, id: &str) -> Result<Persona> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, id)
    }

    pub fn default_persona(&self, user_id: &str) -> Result<Option<Persona>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM personas WHERE user_id = ?1 AND is_default = 1 LIMIT 1",
            Persona::COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![user_id], Persona::from_row)
            .optional()?)
    }

    /// A new default persona replaces the previous default.
    pub fn create_persona(&self, user_id: &str, new: NewPersona) -> Result<Persona> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if new.is_default {
            clear_default(&tx, user_id)?;
        }
        let id = new_id();
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO personas (id, user_id, name, system_prompt, temperature, max_tokens, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                user_id,
                new.name,
                new.system_prompt,
                new.temperature,
                new.max_tokens,
                new.is_default,
                now
            ],
        )?;
        let persona = get_owned(&tx, user_id, &id)?;
        tx.commit()?;
        Ok(persona)
    }

    pub fn update_persona(&self, user_id: &str, id: &str, update: PersonaUpdate) -> Result<Persona> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, id)?;
        if update.is_default == Some(true) {
            clear_default(&tx, user_id)?;
        }
        tx.execute(
            "UPDATE personas SET
                name = COALESCE(?1, name),
                system_prompt = COALESCE(?2, system_prompt),
                temperature = COALESCE(?3, temperature),
                max_tokens = COALESCE(?4, max_tokens),
                is_default = COALESCE(?5, is_default),
                updated_at = ?6
             WHERE id = ?7 AND user_id = ?8",
            params![
                update.name,
                update.system_prompt,
                update.temperature,
                update.max_tokens,
                update.is_default,
                now_timestamp(),
                id,
                user_id
            ],
        )?;
        let persona = get_owned(&tx, user_id, id)?;
        tx.commit()?;
        Ok(persona)
    }

    /// Memories go with the persona; conversations using it fall back to no persona.
    pub fn delete_persona(&self, user_id: &str, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM personas WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("persona"));
        }
        Ok(())
    }

    // ── Persona memories ──

    pub fn list_memories(&self, user_id: &str, persona_id: &str) -> Result<Vec<PersonaMemory>> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, persona_id)?;
        let mut stmt = conn.prepare(
            "SELECT id, persona_id, content, created_at FROM persona_memories
             WHERE persona_id = ?1 AND user_id = ?2 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![persona_id, user_id], |row| {
            Ok(PersonaMemory {
                id: row.get(0)?,
                persona_id: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn add_memory(&self, user_id: &str, persona_id: &str, content: &str) -> Result<PersonaMemory> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, persona_id)?;
        let memory = PersonaMemory {
            id: new_id(),
            persona_id: persona_id.to_string(),
            content: content.to_string(),
            created_at: now_timestamp(),
        };
        conn.execute(
            "INSERT INTO persona_memories (id, persona_id, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![memory.id, persona_id, user_id, memory.content, memory.created_at],
        )?;
        Ok(memory)
    }

    pub fn delete_memory(&self, user_id: &str, persona_id: &str, memory_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM persona_memories WHERE id = ?1 AND persona_id = ?2 AND user_id = ?3",
            params![memory_id, persona_id, user_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("memory"));
        }
        Ok(())
    }
}
