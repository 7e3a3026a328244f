use std::path::Path;

use chrono::NaiveDate;
use rollcall_core::codec::{self, CodecError};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, ClassId, Embedding, Roster, StudentId, SubjectId,
    TeacherId,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("embedding codec: {0}")]
    Codec(#[from] CodecError),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("corrupt attendance row: {0}")]
    CorruptRow(String),
}

/// SQLite-backed storage for rosters, ownership links and attendance.
///
/// Embeddings are stored in the versioned codec layout, sealed with
/// AES-256-GCM. The key is SHA-256 of a configured secret, or a random
/// 32-byte key generated at first use and kept at `{db_dir}/.key`
/// (mode 0600).
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

/// One row of the attendance report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReportRow {
    pub student_id: StudentId,
    pub student_name: Option<String>,
    pub subject_id: SubjectId,
    pub teacher_id: TeacherId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub presence_score: f64,
}

/// A (class, subject) pair a teacher is authorized to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Assignment {
    pub class_id: ClassId,
    pub subject_id: SubjectId,
}

type RawReportRow = (i64, Option<String>, i64, i64, String, String, f64);

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, secret: Option<&str>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if let Some(secret) = secret {
            derive_key(secret)
        } else if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/rollcall"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS teachers (
                     id INTEGER PRIMARY KEY,
                     name TEXT NOT NULL,
                     embedding BLOB
                 );
                 CREATE TABLE IF NOT EXISTS students (
                     id INTEGER PRIMARY KEY,
                     class_id INTEGER NOT NULL,
                     name TEXT NOT NULL,
                     embedding BLOB
                 );
                 CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);
                 CREATE TABLE IF NOT EXISTS teacher_subjects (
                     teacher_id INTEGER NOT NULL,
                     subject_id INTEGER NOT NULL,
                     PRIMARY KEY (teacher_id, subject_id)
                 );
                 CREATE TABLE IF NOT EXISTS class_subjects (
                     class_id INTEGER NOT NULL,
                     subject_id INTEGER NOT NULL,
                     PRIMARY KEY (class_id, subject_id)
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     student_id INTEGER NOT NULL,
                     subject_id INTEGER NOT NULL,
                     teacher_id INTEGER NOT NULL,
                     date TEXT NOT NULL,
                     status TEXT NOT NULL,
                     presence_score REAL NOT NULL,
                     PRIMARY KEY (student_id, subject_id, date)
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert or replace a student and their enrolled embedding.
    pub async fn enroll_student(
        &self,
        student_id: StudentId,
        class_id: ClassId,
        name: &str,
        embedding: Option<&Embedding>,
    ) -> Result<(), StoreError> {
        let blob = embedding.map(|e| self.encrypt_embedding(e)).transpose()?;
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, class_id, name, embedding) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         class_id = excluded.class_id,
                         name = excluded.name,
                         embedding = excluded.embedding",
                    rusqlite::params![student_id, class_id, name, blob],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(student_id, class_id, "student enrolled");
        Ok(())
    }

    /// Insert or replace a teacher, optionally with a face embedding.
    pub async fn enroll_teacher(
        &self,
        teacher_id: TeacherId,
        name: &str,
        embedding: Option<&Embedding>,
    ) -> Result<(), StoreError> {
        let blob = embedding.map(|e| self.encrypt_embedding(e)).transpose()?;
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO teachers (id, name, embedding) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         embedding = excluded.embedding",
                    rusqlite::params![teacher_id, name, blob],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(teacher_id, "teacher enrolled");
        Ok(())
    }

    /// Record that `teacher_id` teaches `subject_id` to `class_id`.
    pub async fn assign_subject(
        &self,
        teacher_id: TeacherId,
        subject_id: SubjectId,
        class_id: ClassId,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO teacher_subjects (teacher_id, subject_id) VALUES (?1, ?2)",
                    [teacher_id, subject_id],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO class_subjects (class_id, subject_id) VALUES (?1, ?2)",
                    [class_id, subject_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// True when the teacher teaches the subject and the subject is taught in the class.
    pub async fn is_authorized(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        subject_id: SubjectId,
    ) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*)
                     FROM teacher_subjects ts
                     JOIN class_subjects cs ON cs.subject_id = ts.subject_id
                     WHERE ts.teacher_id = ?1 AND ts.subject_id = ?2 AND cs.class_id = ?3",
                    [teacher_id, subject_id, class_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every (class, subject) pair `teacher_id` passes [`Self::is_authorized`] for.
    pub async fn list_assignments(
        &self,
        teacher_id: TeacherId,
    ) -> Result<Vec<Assignment>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cs.class_id, cs.subject_id
                     FROM teacher_subjects ts
                     JOIN class_subjects cs ON cs.subject_id = ts.subject_id
                     WHERE ts.teacher_id = ?1
                     ORDER BY cs.class_id, cs.subject_id",
                )?;
                let rows = stmt.query_map([teacher_id], |row| {
                    Ok(Assignment {
                        class_id: row.get(0)?,
                        subject_id: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Decrypted embeddings of every enrolled student in the class.
    ///
    /// Entries that fail to decrypt or decode are skipped with a warning so
    /// one bad row cannot block a whole class.
    pub async fn roster_for_class(&self, class_id: ClassId) -> Result<Roster, StoreError> {
        let rows: Vec<(i64, Vec<u8>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, embedding FROM students
                     WHERE class_id = ?1 AND embedding IS NOT NULL",
                )?;
                let rows = stmt.query_map([class_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(self.decode_gallery(rows))
    }

    /// Ids of every student in the class, with or without an embedding.
    pub async fn class_student_ids(&self, class_id: ClassId) -> Result<Vec<StudentId>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM students WHERE class_id = ?1 ORDER BY id")?;
                let rows = stmt.query_map([class_id], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Decrypted embeddings of every teacher who enrolled a face.
    pub async fn teacher_gallery(&self) -> Result<Roster, StoreError> {
        let rows: Vec<(i64, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, embedding FROM teachers WHERE embedding IS NOT NULL")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(self.decode_gallery(rows))
    }

    /// Upsert attendance records keyed by (student, subject, date).
    pub async fn upsert_records(&self, records: &[AttendanceRecord]) -> Result<usize, StoreError> {
        let rows: Vec<(i64, i64, i64, String, &'static str, f64)> = records
            .iter()
            .map(|r| {
                (
                    r.student_id,
                    r.subject_id,
                    r.teacher_id,
                    r.date.to_string(),
                    r.status.as_str(),
                    r.presence_score,
                )
            })
            .collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO attendance
                             (student_id, subject_id, teacher_id, date, status, presence_score)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(student_id, subject_id, date) DO UPDATE SET
                             teacher_id = excluded.teacher_id,
                             status = excluded.status,
                             presence_score = excluded.presence_score",
                    )?;
                    for row in &rows {
                        stmt.execute(rusqlite::params![row.0, row.1, row.2, row.3, row.4, row.5])?;
                    }
                }
                tx.commit()?;
                Ok(rows.len())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Attendance joined with student names, optionally for a single date.
    pub async fn attendance_report(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<ReportRow>, StoreError> {
        let date = date.map(|d| d.to_string());
        let raw: Vec<RawReportRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.student_id, s.name, a.subject_id, a.teacher_id,
                            a.date, a.status, a.presence_score
                     FROM attendance a
                     LEFT JOIN students s ON s.id = a.student_id
                     WHERE ?1 IS NULL OR a.date = ?1
                     ORDER BY a.date, a.subject_id, a.student_id",
                )?;
                let rows = stmt.query_map([date], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        raw.into_iter()
            .map(
                |(student_id, student_name, subject_id, teacher_id, date, status, presence_score)| {
                    Ok(ReportRow {
                        student_id,
                        student_name,
                        subject_id,
                        teacher_id,
                        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                            .map_err(|e| StoreError::CorruptRow(format!("date {date:?}: {e}")))?,
                        status: status.parse().map_err(StoreError::CorruptRow)?,
                        presence_score,
                    })
                },
            )
            .collect()
    }

    fn decode_gallery(&self, rows: Vec<(i64, Vec<u8>)>) -> Roster {
        let mut roster = Roster::new();
        for (id, blob) in rows {
            match self.decrypt_embedding(&blob) {
                Ok(embedding) => {
                    roster.insert(id, embedding);
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "skipping unreadable embedding");
                }
            }
        }
        roster
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encode and encrypt an embedding with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, embedding: &Embedding) -> Result<Vec<u8>, StoreError> {
        let plaintext = codec::encode(embedding)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt and decode an embedding blob.
    ///
    /// A bare codec blob (written by an external enrollment tool) is
    /// accepted as-is.
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Embedding, StoreError> {
        if blob.starts_with(&codec::MAGIC) {
            if let Ok(embedding) = codec::decode(blob) {
                return Ok(embedding);
            }
        }

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        Ok(codec::decode(&plaintext)?)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
