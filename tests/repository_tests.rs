use std::collections::BTreeMap;

use anyhow::Result;
use tempfile::tempdir;
use uuid::Uuid;

use callscribe::pipeline::{MatchedTag, RequestRecord, RequestStatus, Timestamp};
use callscribe::storage::{Database, RepositoryError, RequestRepository, SqliteRepository};

fn open(path: &std::path::Path) -> Result<SqliteRepository> {
    Ok(SqliteRepository::new(Database::open_path(path, "requests")?))
}

#[tokio::test]
async fn request_survives_reopening_the_database() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("callscribe.db");

    let mut record = RequestRecord::accept(1234567, "gs://b/audio-01.mp3".to_string());
    record.set_timestamp("BeginTranscription", Timestamp::now())?;
    record.working_transcript = Some("[Speaker 1] hello\n".to_string());
    record.matched_tags = BTreeMap::from([(
        "PERSON_NAME".to_string(),
        MatchedTag {
            quote: "Michael".to_string(),
            info_type: "PERSON_NAME".to_string(),
            likelihood: 4,
            begin_byte_offset: 10,
            end_byte_offset: 17,
        },
    )]);

    open(&db_path)?.create(&record).await?;

    let reopened = open(&db_path)?;
    let found = reopened.find_by_id(record.request_id).await?;
    assert_eq!(found, record);

    Ok(())
}

#[tokio::test]
async fn stages_in_separate_processes_merge_their_updates() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("callscribe.db");

    let ingress = open(&db_path)?;
    let transcription = open(&db_path)?;
    let tagging = open(&db_path)?;

    let record = RequestRecord::accept(42, "gs://b/call.mp3".to_string());
    ingress.create(&record).await?;

    let mut transcribed = RequestRecord {
        request_id: record.request_id,
        working_transcript: Some("[Speaker 1] hi\n".to_string()),
        ..RequestRecord::default()
    };
    transcribed.set_timestamp("BeginTranscription", Timestamp::now())?;
    transcribed.set_timestamp("EndTranscription", Timestamp::now())?;
    transcription.update(&transcribed).await?;

    let mut tagged = RequestRecord {
        request_id: record.request_id,
        ..RequestRecord::default()
    };
    tagged.set_timestamp("BeginTagging", Timestamp::now())?;
    let merged = tagging.update(&tagged).await?;

    assert_eq!(merged.customer_id, Some(42));
    assert_eq!(merged.status, Some(RequestStatus::Pending));
    assert_eq!(merged.accepted_at, record.accepted_at);
    assert_eq!(merged.working_transcript, transcribed.working_transcript);
    assert_eq!(
        merged.timestamps.keys().collect::<Vec<_>>(),
        vec!["BeginTagging", "BeginTranscription", "EndTranscription"]
    );

    Ok(())
}

#[tokio::test]
async fn zero_id_is_refused_for_every_operation() -> Result<()> {
    let tmp = tempdir()?;
    let repo = open(&tmp.path().join("callscribe.db"))?;
    let zero = RequestRecord::default();

    assert!(matches!(repo.create(&zero).await, Err(RepositoryError::ZeroId)));
    assert!(matches!(repo.update(&zero).await, Err(RepositoryError::ZeroId)));
    assert!(matches!(
        repo.find_by_id(Uuid::nil()).await,
        Err(RepositoryError::ZeroId)
    ));

    Ok(())
}

#[tokio::test]
async fn replayed_stage_cannot_rewrite_its_timestamps() -> Result<()> {
    let tmp = tempdir()?;
    let repo = open(&tmp.path().join("callscribe.db"))?;

    let mut record = RequestRecord::accept(7, "gs://b/call.mp3".to_string());
    record.set_timestamp("BeginDispatch", Timestamp::now())?;
    repo.create(&record).await?;

    let mut replay = record.clone();
    replay.timestamps.clear();
    replay.set_timestamp("BeginDispatch", Timestamp::now())?;

    let err = repo.update(&replay).await.unwrap_err();
    assert!(matches!(err, RepositoryError::TimestampKeyExists { ref key } if key == "BeginDispatch"));
    assert_eq!(repo.find_by_id(record.request_id).await?, record);

    Ok(())
}
