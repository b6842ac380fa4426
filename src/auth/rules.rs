//! Room authorization rules.

use super::{AuthError, AuthStateProvider};
use slroom_proto::{
    CreateContent, Event, JoinRule, JoinRulesContent, MemberContent, Membership,
    PowerLevelsContent, RoomVersion, RoomVersionRules, UserId, event_type,
};

/// Check `event` against `state`.
pub fn is_authorized(event: &Event, state: &impl AuthStateProvider) -> Result<(), AuthError> {
    if event.is_type(event_type::CREATE) {
        return create_allowed(event);
    }

    let create = state.create_event().ok_or(AuthError::MissingCreateEvent)?;
    if create.room_id() != event.room_id() {
        return Err(AuthError::WrongRoom);
    }
    let create_content = CreateContent::from_value(create.content())?;
    let rules = room_version(&create_content)?.rules();

    if !create_content.federate && event.sender().server_name() != create.sender().server_name() {
        return Err(AuthError::NotFederated);
    }

    let creator = create_content.creator.as_ref().unwrap_or(create.sender());
    let power = power_levels(state, rules, creator)?;

    if event.is_type(event_type::MEMBER) {
        return membership_allowed(event, state, create, creator, &power, rules);
    }

    if membership_of(state, event.sender())? != Some(Membership::Join) {
        return Err(AuthError::SenderNotJoined);
    }

    let sender_level = power.user_level(event.sender());
    let required = power.event_level(event.event_type(), event.is_state());
    if sender_level < required {
        return Err(AuthError::InsufficientPower {
            required,
            actual: sender_level,
        });
    }

    if let Some(key) = event.state_key()
        && key.starts_with('@')
        && key != event.sender().as_str()
    {
        return Err(AuthError::StateKeyNotSender(key.to_string()));
    }

    if event.is_type(event_type::POWER_LEVELS) {
        return power_levels_change_allowed(event, state, &power, rules, sender_level);
    }

    Ok(())
}

fn room_version(content: &CreateContent) -> Result<RoomVersion, AuthError> {
    let version = content.room_version.as_deref().unwrap_or("1");
    version
        .parse()
        .map_err(|_| AuthError::UnsupportedRoomVersion(version.to_string()))
}

fn create_allowed(event: &Event) -> Result<(), AuthError> {
    if !event.prev_events().is_empty() {
        return Err(AuthError::CreateHasPrevEvents);
    }
    if event.state_key() != Some("") {
        return Err(AuthError::CreateStateKey);
    }
    if event.room_id().server_name() != event.sender().server_name() {
        return Err(AuthError::CreateWrongDomain);
    }
    let content = CreateContent::from_value(event.content())?;
    room_version(&content)?;
    Ok(())
}

fn power_levels(
    state: &impl AuthStateProvider,
    rules: RoomVersionRules,
    creator: &UserId,
) -> Result<PowerLevelsContent, AuthError> {
    match state.power_levels_event() {
        Some(pl) => Ok(PowerLevelsContent::from_value(
            pl.content(),
            rules.integer_power_levels,
        )?),
        None => Ok(PowerLevelsContent::without_event(Some(creator))),
    }
}

fn membership_of(
    state: &impl AuthStateProvider,
    user: &UserId,
) -> Result<Option<Membership>, AuthError> {
    match state.member_event(user) {
        Some(event) => Ok(event.membership()?),
        None => Ok(None),
    }
}

fn join_rule(state: &impl AuthStateProvider) -> Result<JoinRule, AuthError> {
    match state.join_rules_event() {
        Some(event) => Ok(JoinRulesContent::from_value(event.content())?.join_rule),
        None => Ok(JoinRule::Invite),
    }
}

// ============================================================================
// Membership
// ============================================================================

fn membership_allowed(
    event: &Event,
    state: &impl AuthStateProvider,
    create: &Event,
    creator: &UserId,
    power: &PowerLevelsContent,
    rules: RoomVersionRules,
) -> Result<(), AuthError> {
    let target = event.membership_target().ok_or(AuthError::InvalidStateKey)?;
    let content = MemberContent::from_value(event.content())?;
    let sender = event.sender();

    let sender_membership = membership_of(state, sender)?;
    let target_membership = membership_of(state, &target)?;
    let sender_level = power.user_level(sender);
    let target_level = power.user_level(&target);

    match content.membership {
        Membership::Join => {
            // The creator's own join directly after the create event.
            if let [prev] = event.prev_events()
                && prev == create.event_id()
                && &target == creator
            {
                return Ok(());
            }
            if sender != &target {
                return Err(AuthError::Membership("cannot join on behalf of another user"));
            }
            if target_membership == Some(Membership::Ban) {
                return Err(AuthError::Membership("user is banned"));
            }
            let already_in = matches!(
                target_membership,
                Some(Membership::Join) | Some(Membership::Invite)
            );
            match join_rule(state)? {
                JoinRule::Public => Ok(()),
                JoinRule::Invite => invited_or_joined(already_in),
                JoinRule::Knock if rules.knock => invited_or_joined(already_in),
                JoinRule::Restricted if rules.restricted_join => {
                    restricted_join_allowed(already_in, &content, state, power)
                }
                JoinRule::KnockRestricted if rules.knock_restricted => {
                    restricted_join_allowed(already_in, &content, state, power)
                }
                _ => Err(AuthError::Membership("join rule does not allow joining")),
            }
        }
        Membership::Invite => {
            if sender_membership != Some(Membership::Join) {
                return Err(AuthError::SenderNotJoined);
            }
            if matches!(
                target_membership,
                Some(Membership::Join) | Some(Membership::Ban)
            ) {
                return Err(AuthError::Membership("target is already joined or banned"));
            }
            if sender_level < power.invite {
                return Err(AuthError::InsufficientPower {
                    required: power.invite,
                    actual: sender_level,
                });
            }
            Ok(())
        }
        Membership::Leave => {
            if sender == &target {
                return match target_membership {
                    Some(Membership::Join) | Some(Membership::Invite) | Some(Membership::Knock) => {
                        Ok(())
                    }
                    _ => Err(AuthError::Membership("user is not in the room")),
                };
            }
            if sender_membership != Some(Membership::Join) {
                return Err(AuthError::SenderNotJoined);
            }
            if target_membership == Some(Membership::Ban) && sender_level < power.ban {
                return Err(AuthError::InsufficientPower {
                    required: power.ban,
                    actual: sender_level,
                });
            }
            if sender_level >= power.kick && target_level < sender_level {
                Ok(())
            } else {
                Err(AuthError::Membership("cannot kick a user at or above your level"))
            }
        }
        Membership::Ban => {
            if sender_membership != Some(Membership::Join) {
                return Err(AuthError::SenderNotJoined);
            }
            if sender_level >= power.ban && target_level < sender_level {
                Ok(())
            } else {
                Err(AuthError::Membership("cannot ban a user at or above your level"))
            }
        }
        Membership::Knock => {
            if !rules.knock {
                return Err(AuthError::Membership("room version does not support knocking"));
            }
            let knockable = match join_rule(state)? {
                JoinRule::Knock => true,
                JoinRule::KnockRestricted => rules.knock_restricted,
                _ => false,
            };
            if !knockable {
                return Err(AuthError::Membership("join rule does not allow knocking"));
            }
            if sender != &target {
                return Err(AuthError::Membership("cannot knock on behalf of another user"));
            }
            if matches!(
                target_membership,
                Some(Membership::Join) | Some(Membership::Ban)
            ) {
                return Err(AuthError::Membership("user is already joined or banned"));
            }
            Ok(())
        }
    }
}

fn invited_or_joined(already_in: bool) -> Result<(), AuthError> {
    if already_in {
        Ok(())
    } else {
        Err(AuthError::Membership("join rule requires an invite"))
    }
}

fn restricted_join_allowed(
    already_in: bool,
    content: &MemberContent,
    state: &impl AuthStateProvider,
    power: &PowerLevelsContent,
) -> Result<(), AuthError> {
    if already_in {
        return Ok(());
    }
    let via = content
        .join_authorised_via_users_server
        .as_ref()
        .ok_or(AuthError::Membership("restricted join needs an authorising user"))?;
    if membership_of(state, via)? != Some(Membership::Join) {
        return Err(AuthError::Membership("authorising user is not joined"));
    }
    if power.user_level(via) < power.invite {
        return Err(AuthError::Membership("authorising user cannot invite"));
    }
    Ok(())
}

// ============================================================================
// Power levels
// ============================================================================

fn power_levels_change_allowed(
    event: &Event,
    state: &impl AuthStateProvider,
    current: &PowerLevelsContent,
    rules: RoomVersionRules,
    sender_level: i64,
) -> Result<(), AuthError> {
    let new = PowerLevelsContent::from_value(event.content(), rules.integer_power_levels)?;
    if state.power_levels_event().is_none() {
        return Ok(());
    }

    let top_level = [
        ("ban", current.ban, new.ban),
        ("kick", current.kick, new.kick),
        ("invite", current.invite, new.invite),
        ("redact", current.redact, new.redact),
        ("events_default", current.events_default, new.events_default),
        ("state_default", current.state_default, new.state_default),
        ("users_default", current.users_default, new.users_default),
    ];
    for (name, old, new) in top_level {
        if old != new && (old > sender_level || new > sender_level) {
            return Err(AuthError::PowerLevels(format!(
                "{name} change from {old} to {new} exceeds sender level {sender_level}"
            )));
        }
    }

    let event_types = current.events.keys().chain(new.events.keys());
    for event_type in event_types {
        let old = current.events.get(event_type);
        let changed = new.events.get(event_type);
        if old == changed {
            continue;
        }
        if old.is_some_and(|l| *l > sender_level) || changed.is_some_and(|l| *l > sender_level) {
            return Err(AuthError::PowerLevels(format!(
                "events.{event_type} change exceeds sender level {sender_level}"
            )));
        }
    }

    let users = current.users.keys().chain(new.users.keys());
    for user in users {
        let old = current.users.get(user);
        let changed = new.users.get(user);
        if old == changed {
            continue;
        }
        if changed.is_some_and(|l| *l > sender_level) {
            return Err(AuthError::PowerLevels(format!(
                "users.{user} raised above sender level {sender_level}"
            )));
        }
        if user != event.sender() && old.is_some_and(|l| *l >= sender_level) {
            return Err(AuthError::PowerLevels(format!(
                "users.{user} is at or above sender level {sender_level}"
            )));
        }
    }

    Ok(())
}
