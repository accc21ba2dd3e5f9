use crate::StoreError;
use relay_types::Agent;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Inserts an agent, or replaces the configuration of an existing one.
pub fn upsert_agent(conn: &Connection, agent: &Agent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO agents (agent_id, client_id, name, system_prompt, greeting, voice, language)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(agent_id) DO UPDATE SET
            client_id = excluded.client_id,
            name = excluded.name,
            system_prompt = excluded.system_prompt,
            greeting = excluded.greeting,
            voice = excluded.voice,
            language = excluded.language,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![
            agent.agent_id,
            agent.client_id,
            agent.name,
            agent.system_prompt,
            agent.greeting,
            agent.voice,
            agent.language,
        ],
    )?;
    Ok(())
}

/// Loads an agent by its public ID.
pub fn get_agent(conn: &Connection, agent_id: &str) -> Result<Agent, StoreError> {
    conn.query_row(
        "SELECT agent_id, client_id, name, system_prompt, greeting, voice, language
         FROM agents WHERE agent_id = ?1",
        [agent_id],
        map_row_to_agent,
    )
    .optional()?
    .ok_or_else(|| StoreError::AgentNotFound(agent_id.to_string()))
}

fn map_row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        agent_id: row.get(0)?,
        client_id: row.get(1)?,
        name: row.get(2)?,
        system_prompt: row.get(3)?,
        greeting: row.get(4)?,
        voice: row.get(5)?,
        language: row.get(6)?,
    })
}
