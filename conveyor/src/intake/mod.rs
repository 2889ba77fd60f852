//! File intake front-end.
//!
//! Admits an external file, runs the file checker registered for its type,
//! and turns accepted contents into a batch. Raw bytes land in the incoming
//! bucket under a sanitised key; rejected files that already live in the
//! incoming bucket are moved to the failed bucket. Every decision leaves a
//! `BatchFile` record carrying the checksum and validity flag.

use serde_json::Value;

use crate::batch::BatchId;
use crate::blob::sha256_hex;
use crate::engine::Engine;
use crate::error::{ConveyorError, Result};
use crate::registry::FileCheck;
use crate::store::{NewBatchFile, Store};

pub mod watcher;

/// Where the intake bytes come from.
pub enum FileSource {
    /// Raw bytes pushed by the caller
    Bytes(Vec<u8>),
    /// Key of an object already uploaded to the incoming bucket
    ObjectKey(String),
}

impl<S: Store + 'static> Engine<S> {
    /// Admit an external file and build a batch from its contents.
    ///
    /// Returns the new batch's identity, or [`ConveyorError::IntakeRejected`]
    /// when the file checker turns the file down.
    #[tracing::instrument(skip(self, source, context))]
    pub async fn intake_file(
        &self,
        source: FileSource,
        filename: &str,
        file_type: &str,
        context: Value,
    ) -> Result<BatchId> {
        let checker = self.registry.checker(file_type)?;

        let (contents, origin_key) = match source {
            FileSource::Bytes(bytes) => (bytes, None),
            FileSource::ObjectKey(key) => {
                let bytes = self.objects.get(&self.config.buckets.incoming, &key).await?;
                (bytes, Some(key))
            }
        };

        match checker.check(&contents, filename, &context).await? {
            FileCheck::Rejected { reason } => {
                // Preserve the rejected bytes in the failed bucket when they
                // came from the incoming bucket, and record the failure.
                if let Some(key) = origin_key {
                    self.objects
                        .copy(
                            &self.config.buckets.incoming,
                            &key,
                            &self.config.buckets.failed,
                            &key,
                        )
                        .await?;
                    self.objects
                        .delete(&self.config.buckets.incoming, &key)
                        .await?;

                    self.store
                        .insert_batch_file(NewBatchFile {
                            object_key: key,
                            size_bytes: contents.len() as i64,
                            checksum: sha256_hex(&contents),
                            valid: false,
                            batch_id: None,
                        })
                        .await?;
                }

                tracing::warn!(filename, file_type, reason, "intake file rejected");
                Err(ConveyorError::IntakeRejected {
                    filename: filename.to_string(),
                    reason,
                })
            }
            FileCheck::Accepted {
                context,
                rows,
                app,
                op,
            } => {
                let batch = self.submit(&app, &op, context, rows, false).await?;

                let key = match origin_key {
                    Some(key) => key,
                    None => {
                        let key =
                            sanitize_object_key(filename, self.config.max_object_key_len);
                        self.objects
                            .put(
                                &self.config.buckets.incoming,
                                &key,
                                contents.clone(),
                                None,
                            )
                            .await?;
                        key
                    }
                };

                self.store
                    .insert_batch_file(NewBatchFile {
                        object_key: key.clone(),
                        size_bytes: contents.len() as i64,
                        checksum: sha256_hex(&contents),
                        valid: true,
                        batch_id: Some(batch),
                    })
                    .await?;

                tracing::info!(filename, batch = %batch, key, "intake file accepted");
                Ok(batch)
            }
        }
    }
}

/// Derive an object key from a filename: whitespace and path separators
/// become `_`, and the result is truncated to `max_len` characters.
///
/// Sanitised names are not unique by construction; aggregated outputs avoid
/// collisions by prefixing the batch identity, intake keys match the source
/// system's caller-responsibility behaviour.
pub fn sanitize_object_key(filename: &str, max_len: usize) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .take(max_len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators_and_whitespace() {
        assert_eq!(
            sanitize_object_key("reports/march orders.csv", 500),
            "reports_march_orders.csv"
        );
        assert_eq!(
            sanitize_object_key("a\\b\tc d.txt", 500),
            "a_b_c_d.txt"
        );
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "x".repeat(600);
        assert_eq!(sanitize_object_key(&long, 500).len(), 500);
    }
}
