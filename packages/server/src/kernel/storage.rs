//! Persistence collaborator for sensor readings and images.
//!
//! Provides a trait-based store that allows swapping between the real
//! Postgres implementation and an in-memory test recorder, mirroring how the
//! broker client is abstracted for tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Mutex;

/// A validated sensor reading ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub tray_number: i32,
    pub length: f64,
    pub width: f64,
    pub area: f64,
    pub weight: f64,
    pub count: i32,
    pub timestamp: DateTime<Utc>,
}

/// A decoded image ready to persist, either alongside a reading or on its own.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub tray_number: i32,
    pub data: Vec<u8>,
    pub format: String,
    pub size: i32,
    pub avg_length: Option<f64>,
    pub avg_weight: Option<f64>,
    pub count: Option<i32>,
    /// Annotation blobs stored as their JSON text, when supplied.
    pub bounding_boxes: Option<String>,
    pub masks: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Row ids assigned by a successful [`MeasurementStore::persist_reading`].
#[derive(Debug, Clone, Copy)]
pub struct PersistedReading {
    pub reading_id: i32,
    pub image_id: Option<i32>,
}

/// Trait for reading/image persistence.
///
/// Both operations are transactional: a reading and its embedded image are
/// committed together or not at all.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persist a reading and its optional image in one transaction.
    async fn persist_reading(
        &self,
        reading: &NewReading,
        image: Option<&NewImage>,
    ) -> Result<PersistedReading>;

    /// Persist a standalone uploaded image.
    async fn persist_image(&self, image: &NewImage) -> Result<i32>;
}

/// Postgres-backed store.
pub struct PgMeasurementStore {
    pool: PgPool,
}

impl PgMeasurementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeasurementStore for PgMeasurementStore {
    async fn persist_reading(
        &self,
        reading: &NewReading,
        image: Option<&NewImage>,
    ) -> Result<PersistedReading> {
        let mut tx = self.pool.begin().await?;

        let reading_id: i32 = sqlx::query_scalar(
            "INSERT INTO larvae_data (tray_number, length, width, area, weight, count, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(reading.tray_number)
        .bind(reading.length)
        .bind(reading.width)
        .bind(reading.area)
        .bind(reading.weight)
        .bind(reading.count)
        .bind(reading.timestamp)
        .fetch_one(&mut *tx)
        .await?;

        let image_id = match image {
            Some(image) => Some(insert_image(&mut tx, image).await?),
            None => None,
        };

        // Dropping the transaction without commit rolls both inserts back
        tx.commit().await?;

        Ok(PersistedReading {
            reading_id,
            image_id,
        })
    }

    async fn persist_image(&self, image: &NewImage) -> Result<i32> {
        let mut tx = self.pool.begin().await?;
        let image_id = insert_image(&mut tx, image).await?;
        tx.commit().await?;
        Ok(image_id)
    }
}

async fn insert_image(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    image: &NewImage,
) -> Result<i32> {
    let image_id: i32 = sqlx::query_scalar(
        "INSERT INTO image_files
             (tray_number, image_data, image_format, image_size,
              avg_length, avg_weight, count, bounding_boxes, masks, timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING id",
    )
    .bind(image.tray_number)
    .bind(&image.data)
    .bind(&image.format)
    .bind(image.size)
    .bind(image.avg_length)
    .bind(image.avg_weight)
    .bind(image.count)
    .bind(&image.bounding_boxes)
    .bind(&image.masks)
    .bind(image.timestamp)
    .fetch_one(&mut **tx)
    .await?;
    Ok(image_id)
}

/// In-memory store that records what would have been persisted.
///
/// Lets tests inspect persistence without a database, and can be told to
/// fail so rollback paths are exercised.
#[derive(Default)]
pub struct TestStore {
    readings: Mutex<Vec<(NewReading, Option<NewImage>)>>,
    images: Mutex<Vec<NewImage>>,
    fail_next: Mutex<bool>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent persistence call fail.
    pub fn fail_persistence(&self) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn reading_count(&self) -> usize {
        self.readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn image_count(&self) -> usize {
        let embedded = self
            .readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, image)| image.is_some())
            .count();
        embedded + self.images.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn readings(&self) -> Vec<(NewReading, Option<NewImage>)> {
        self.readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn uploaded_images(&self) -> Vec<NewImage> {
        self.images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn should_fail(&self) -> bool {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MeasurementStore for TestStore {
    async fn persist_reading(
        &self,
        reading: &NewReading,
        image: Option<&NewImage>,
    ) -> Result<PersistedReading> {
        if self.should_fail() {
            bail!("simulated database failure");
        }
        let mut readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        readings.push((reading.clone(), image.cloned()));
        let reading_id = readings.len() as i32;
        Ok(PersistedReading {
            reading_id,
            image_id: image.map(|_| reading_id),
        })
    }

    async fn persist_image(&self, image: &NewImage) -> Result<i32> {
        if self.should_fail() {
            bail!("simulated database failure");
        }
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.push(image.clone());
        Ok(images.len() as i32)
    }
}
