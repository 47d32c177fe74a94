//! Built-in pipeline definitions shipped with Starload.
//!
//! Each pipeline is defined as a YAML string constant that can be parsed
//! by the pipeline parser.

use crate::error::PipelineError;
use crate::pipeline::parser::parse_pipeline;
use crate::pipeline::types::PipelineDefinition;

/// Returns the list of all built-in pipeline names.
pub fn list_builtin_names() -> Vec<&'static str> {
    vec!["songplays"]
}

/// Load a built-in pipeline by name.
///
/// Returns `Ok(None)` for an unknown name and an error when the shipped
/// definition does not parse.
pub fn get_builtin(name: &str) -> Result<Option<PipelineDefinition>, PipelineError> {
    let yaml = match name {
        "songplays" => SONGPLAYS_PIPELINE,
        _ => return Ok(None),
    };
    parse_pipeline(yaml)
        .map(Some)
        .map_err(|e| PipelineError::ParseError {
            message: format!("built-in pipeline '{name}': {e}"),
        })
}

/// Load all built-in pipelines.
pub fn all_builtins() -> Result<Vec<PipelineDefinition>, PipelineError> {
    let mut pipelines = Vec::new();
    for name in list_builtin_names() {
        pipelines.extend(get_builtin(name)?);
    }
    Ok(pipelines)
}

/// Event logs and song metadata into the songplays star schema.
const SONGPLAYS_PIPELINE: &str = r#"
name: songplays
description: Load and transform song play events into a star schema
version: "1.0"
defaults:
  retry:
    max_attempts: 4
    delay_secs: 300
    backoff: fixed
tasks:
  - name: stage_events
    kind: stage
    params:
      table: public.staging_events
      source_key: log_data/
      json_path: s3://udacity-dend/log_json_path.json

  - name: stage_songs
    kind: stage
    params:
      table: public.staging_songs
      source_key: song_data/

  - name: load_songplays_fact
    kind: load_fact
    upstream: [stage_events, stage_songs]
    params:
      table: public.songplays
      query: |
        SELECT
          MD5(events.sessionid || events.start_time) AS songplay_id,
          events.start_time,
          events.userid,
          events.level,
          songs.song_id,
          songs.artist_id,
          events.sessionid,
          events.location,
          events.useragent
        FROM (SELECT TIMESTAMP 'epoch' + ts/1000 * interval '1 second' AS start_time, *
              FROM staging_events
              WHERE page='NextSong') AS events
        LEFT JOIN staging_songs songs
               ON events.song = songs.title
              AND events.artist = songs.artist_name
              AND events.length = songs.duration

  - name: load_user_dim
    kind: load_dimension
    upstream: [load_songplays_fact]
    params:
      table: public.users
      query: |
        SELECT DISTINCT userid, firstname, lastname, gender, level
        FROM staging_events
        WHERE page='NextSong'

  - name: load_song_dim
    kind: load_dimension
    upstream: [load_songplays_fact]
    params:
      table: public.songs
      query: |
        SELECT DISTINCT song_id, title, artist_id, year, duration
        FROM staging_songs

  - name: load_artist_dim
    kind: load_dimension
    upstream: [load_songplays_fact]
    params:
      table: public.artists
      query: |
        SELECT DISTINCT artist_id, artist_name, artist_location, artist_latitude, artist_longitude
        FROM staging_songs

  - name: load_time_dim
    kind: load_dimension
    upstream: [load_songplays_fact]
    params:
      table: public.time
      query: |
        SELECT start_time, EXTRACT(HOUR FROM start_time), EXTRACT(DAY FROM start_time), EXTRACT(WEEK FROM start_time),
               EXTRACT(MONTH FROM start_time), EXTRACT(YEAR FROM start_time), EXTRACT(DAYOFWEEK FROM start_time)
        FROM songplays

  - name: run_quality_checks
    kind: validate_quality
    upstream: [load_user_dim, load_song_dim, load_artist_dim, load_time_dim]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::TaskGraph;
    use crate::pipeline::parser::validate_pipeline;
    use crate::pipeline::types::{RetryPolicy, TaskOperation};

    #[test]
    fn test_builtin_songplays_parses() {
        let def = parse_pipeline(SONGPLAYS_PIPELINE).unwrap();
        assert_eq!(def.name, "songplays");
        assert_eq!(def.tasks.len(), 8);
        let retry = def.defaults.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.delay.as_secs(), 300);
    }

    #[test]
    fn test_all_builtins_validate() {
        for name in list_builtin_names() {
            let def = get_builtin(name)
                .unwrap_or_else(|e| panic!("Builtin '{}' failed to parse: {}", name, e))
                .unwrap_or_else(|| panic!("Failed to load builtin: {}", name));
            validate_pipeline(&def)
                .unwrap_or_else(|e| panic!("Builtin '{}' failed validation: {}", name, e));
            TaskGraph::from_definition(&def, &RetryPolicy::default())
                .unwrap_or_else(|e| panic!("Builtin '{}' failed to build: {}", name, e));
        }
    }

    #[test]
    fn test_songplays_quality_task_uses_configured_rules() {
        let def = get_builtin("songplays").unwrap().unwrap();
        let task = def
            .tasks
            .iter()
            .find(|t| t.name == "run_quality_checks")
            .unwrap();
        assert_eq!(
            task.operation,
            TaskOperation::ValidateQuality(Default::default())
        );
    }

    #[test]
    fn test_songplays_topology() {
        let def = get_builtin("songplays").unwrap().unwrap();
        let graph = TaskGraph::from_definition(&def, &RetryPolicy::default()).unwrap();
        assert_eq!(
            graph.levels(),
            vec![
                vec!["begin"],
                vec!["stage_events", "stage_songs"],
                vec!["load_songplays_fact"],
                vec![
                    "load_user_dim",
                    "load_song_dim",
                    "load_artist_dim",
                    "load_time_dim"
                ],
                vec!["run_quality_checks"],
                vec!["end"],
            ]
        );
    }

    #[test]
    fn test_songplays_dimensions_replace() {
        let def = get_builtin("songplays").unwrap().unwrap();
        for task in def.tasks.iter().filter(|t| t.name.ends_with("_dim")) {
            match &task.operation {
                TaskOperation::LoadDimension(p) => assert!(p.replace, "{}", task.name),
                other => panic!("Expected LoadDimension, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(get_builtin("nope").unwrap().is_none());
        assert_eq!(all_builtins().unwrap().len(), list_builtin_names().len());
    }
}
