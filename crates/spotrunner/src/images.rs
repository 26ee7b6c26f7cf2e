//! Image state updates coming from the build pipeline.
//!
//! Build signals may arrive late or out of order, so every write goes through the conditional
//! upsert of the image state store. Only an accepted `ready` write touches the profile.
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::router::profile::MachineProfile;
use crate::router::store::ProfileStore;
use crate::store::ImageStateStore;
use crate::store::records::{ImageStateRecord, ImageStatus};

/// Outcome of a single build, as reported by the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    pub profile: String,
    pub status: ImageStatus,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A newer record exists already.
    Stale,
}

/// Serializes profile image updates of this process.
static PROFILE_IMAGE_LOCK: Mutex<()> = Mutex::new(());

/// Copies the image of the stored record into the profile.
///
/// The record is read again under the lock, so the profile ends up with the image of the
/// newest accepted write even when the writers reach this point in a different order.
fn sync_profile_image(
    images: &dyn ImageStateStore,
    profiles: &dyn ProfileStore,
    profile: &str,
) -> crate::Result<()> {
    let _guard = PROFILE_IMAGE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(record) = images.get_image(profile)? else {
        return Ok(());
    };
    let (ImageStatus::Ready, Some(image_id)) = (record.status, &record.image_id) else {
        return Ok(());
    };
    if profiles.set_image_id(profile, image_id)? {
        log::info!("Profile `{profile}` now uses image {image_id}");
    } else {
        log::warn!("Image {image_id} is ready, but profile `{profile}` does not exist");
    }
    Ok(())
}

/// Writes the image state described by `event`.
///
/// A `failed` or `building` event keeps the image id of the stored record, so workers keep
/// booting from the last good image.
pub fn apply_build_event(
    images: &dyn ImageStateStore,
    profiles: &dyn ProfileStore,
    event: &BuildEvent,
) -> crate::Result<ApplyOutcome> {
    let image_id = match event.status {
        ImageStatus::Ready => match event.image_id.as_deref().filter(|id| !id.is_empty()) {
            Some(image_id) => Some(image_id.to_string()),
            None => {
                return Err(crate::Error::GenericError(format!(
                    "Ready image of profile `{}` has no image id",
                    event.profile
                )));
            }
        },
        ImageStatus::Building | ImageStatus::Failed => images
            .get_image(&event.profile)?
            .and_then(|record| record.image_id),
    };
    let record = ImageStateRecord {
        profile_name: event.profile.clone(),
        image_id,
        status: event.status,
        updated_at: event.timestamp,
        build_id: event.build_id.clone(),
        error_message: event.error.clone(),
    };
    if !images.put_image_if_newer(&record)? {
        log::debug!(
            "Ignoring {} signal of profile `{}` older than the stored state",
            event.status,
            event.profile
        );
        return Ok(ApplyOutcome::Stale);
    }

    match record.status {
        ImageStatus::Ready => sync_profile_image(images, profiles, &record.profile_name)?,
        ImageStatus::Failed => {
            log::warn!(
                "Image build of profile `{}` failed: {}",
                record.profile_name,
                record.error_message.as_deref().unwrap_or("unknown reason")
            );
        }
        ImageStatus::Building => {}
    }
    Ok(ApplyOutcome::Applied)
}

/// Validates and stores a profile document.
///
/// A profile deployed for the first time gets a `building` image record without an image,
/// an existing record is left alone.
pub fn deploy_profile(
    images: &dyn ImageStateStore,
    profiles: &dyn ProfileStore,
    name: &str,
    document: serde_json::Value,
    now: DateTime<Utc>,
) -> crate::Result<MachineProfile> {
    let profile = MachineProfile::from_document(name, document.clone())
        .map_err(|e| crate::Error::ConfigError(e.to_string()))?;
    if profile.name != name {
        return Err(crate::Error::ConfigError(format!(
            "Profile document names `{}`, but it is deployed as `{name}`",
            profile.name
        )));
    }
    profiles.put(name, &document)?;
    if images.get_image(name)?.is_none() {
        let created = images.put_image_if_newer(&ImageStateRecord {
            profile_name: name.to_string(),
            image_id: None,
            status: ImageStatus::Building,
            updated_at: now,
            build_id: None,
            error_message: None,
        })?;
        if created {
            log::info!("Image record of profile `{name}` created");
        }
    }
    log::info!("Profile `{name}` deployed");
    Ok(profile)
}
