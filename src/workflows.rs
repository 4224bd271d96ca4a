//! Multi-step operations built on the storage contract
//!
//! These run against any [`StorageBackend`] and carry no backend-specific
//! logic. None of them is atomic across steps.

use crate::error::{Result, StoreError};
use crate::storage::StorageBackend;
use crate::types::{
    CollectionItem, InvitationStatus, MemberRole, OrganizationInvitation, OrganizationMembership, User,
    NORMALIZED_URL_KEY,
};
use crate::utils::normalize_url;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Accept an invitation on behalf of `user`
///
/// Checks expiry and that the user's email matches the invited address, then
/// marks the invitation accepted and adds the user as a member. An expired
/// invitation is persisted as expired before the error is returned.
pub async fn accept_invitation(
    store: &dyn StorageBackend,
    token: &str,
    user: &User,
    now: DateTime<Utc>,
) -> Result<OrganizationMembership> {
    let mut invitation = store.get_invitation_by_token(token).await?;

    if let Err(e) = invitation.accept(user, now) {
        if invitation.status == InvitationStatus::Expired {
            if let Err(persist) = store.update_invitation(&mut invitation).await {
                warn!("Failed to mark invitation {} expired: {}", invitation.id, persist);
            }
        }
        return Err(e);
    }

    store.update_invitation(&mut invitation).await?;

    let mut membership =
        OrganizationMembership::new(&invitation.organization_id, &user.id, MemberRole::Member);
    store.add_organization_member(&mut membership).await?;

    info!(
        "User {} joined organization {} by invitation",
        user.id, invitation.organization_id
    );
    Ok(membership)
}

/// Decline a pending invitation
pub async fn decline_invitation(store: &dyn StorageBackend, token: &str) -> Result<OrganizationInvitation> {
    let mut invitation = store.get_invitation_by_token(token).await?;
    invitation.transition(InvitationStatus::Declined)?;
    store.update_invitation(&mut invitation).await?;
    Ok(invitation)
}

/// Insert `item` unless the collection already holds a live item with the
/// same normalized URL
///
/// Returns the stored item and whether it was created. The normalized URL is
/// tagged into the new item's metadata so later lookups hit the indexed path.
pub async fn add_item_if_absent(
    store: &dyn StorageBackend,
    mut item: CollectionItem,
) -> Result<(CollectionItem, bool)> {
    if item.url.trim().is_empty() {
        return Err(StoreError::InvalidInput("item url must not be empty".to_string()));
    }

    if let Some(existing) = store
        .find_item_by_normalized_url(&item.collection_id, &item.url)
        .await?
    {
        debug!("Item for {} already present as {}", item.url, existing.id);
        return Ok((existing, false));
    }

    if !item.metadata.is_object() {
        item.metadata = serde_json::json!({});
    }
    if let Some(map) = item.metadata.as_object_mut() {
        map.insert(NORMALIZED_URL_KEY.to_string(), normalize_url(&item.url).into());
    }

    store.create_collection_item(&mut item).await?;
    Ok((item, true))
}
