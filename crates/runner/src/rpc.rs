//! Remote mutation channel.
//!
//! The input authority of an entity asks the state authority to assign one of
//! the entity's networked fields. Issuing a request requires an
//! [`InputAuthority`] token; on arrival the state authority checks again
//! against the transport-bound sender, so a peer that forges a request for an
//! entity it does not control is rejected.

use pilot_sim::{EntityId, PeerId};
use pilot_wire::SetFieldRequest;

use crate::authority::{AuthorityMap, InputAuthority};
use crate::error::{AuthorityError, RpcError};
use crate::field::FieldKey;

/// A request that passed authorization on the state authority.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedMutation {
    pub entity: EntityId,
    pub field: FieldKey,
    pub value: String,
}

/// Build the outgoing request for `token`'s entity.
pub fn build_request(
    token: &InputAuthority,
    field: FieldKey,
    value: &str,
    authority: &AuthorityMap,
) -> Result<SetFieldRequest, RpcError> {
    authority.verify_input(token)?;
    if !field.is_remote_settable() {
        return Err(RpcError::FieldNotSettable(field.as_str().to_string()));
    }
    Ok(SetFieldRequest {
        entity_id: token.entity(),
        field_name: field.as_str().to_string(),
        value: value.to_string(),
    })
}

/// Check an incoming request against the roles known to the state authority.
pub fn authorize(
    request: SetFieldRequest,
    sender: PeerId,
    authority: &AuthorityMap,
) -> Result<AuthorizedMutation, RpcError> {
    let entity = request.entity_id;
    if !authority.contains(entity) {
        return Err(RpcError::UnknownEntity(entity));
    }
    if !authority.is_state_authority(entity) {
        return Err(AuthorityError::RoleNotHeld {
            role: "state authority",
            entity,
        }
        .into());
    }
    if authority.input_peer(entity) != Some(sender) {
        return Err(RpcError::NotInputAuthority { sender, entity });
    }

    let field = FieldKey::parse(&request.field_name)
        .filter(FieldKey::is_remote_settable)
        .ok_or_else(|| RpcError::FieldNotSettable(request.field_name.clone()))?;

    Ok(AuthorizedMutation {
        entity,
        field,
        value: request.value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Roles;

    const HOST: PeerId = 1;
    const OWNER: PeerId = 2;
    const OTHER: PeerId = 3;

    fn map(local: PeerId) -> AuthorityMap {
        let mut map = AuthorityMap::new(local);
        map.assign(
            5,
            Roles {
                state: HOST,
                input: Some(OWNER),
            },
        );
        map
    }

    fn request(field: &str) -> SetFieldRequest {
        SetFieldRequest {
            entity_id: 5,
            field_name: field.to_string(),
            value: "Player_2".to_string(),
        }
    }

    #[test]
    fn test_owner_request_authorized() {
        let result = authorize(request("PlayerName"), OWNER, &map(HOST)).unwrap();
        assert_eq!(
            result,
            AuthorizedMutation {
                entity: 5,
                field: FieldKey::PlayerName,
                value: "Player_2".to_string()
            }
        );
    }

    #[test]
    fn test_non_owner_rejected() {
        let result = authorize(request("PlayerName"), OTHER, &map(HOST));
        assert_eq!(
            result,
            Err(RpcError::NotInputAuthority {
                sender: OTHER,
                entity: 5
            })
        );
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let mut req = request("PlayerName");
        req.entity_id = 42;
        assert_eq!(
            authorize(req, OWNER, &map(HOST)),
            Err(RpcError::UnknownEntity(42))
        );
    }

    #[test]
    fn test_unsettable_field_rejected() {
        assert_eq!(
            authorize(request("Transform"), OWNER, &map(HOST)),
            Err(RpcError::FieldNotSettable("Transform".to_string()))
        );
        assert_eq!(
            authorize(request("Health"), OWNER, &map(HOST)),
            Err(RpcError::FieldNotSettable("Health".to_string()))
        );
    }

    #[test]
    fn test_only_state_authority_executes() {
        let result = authorize(request("PlayerName"), OWNER, &map(OTHER));
        assert!(matches!(
            result,
            Err(RpcError::Authority(AuthorityError::RoleNotHeld { .. }))
        ));
    }

    #[test]
    fn test_build_request_requires_live_token() {
        let mut on_owner = map(OWNER);
        let token = on_owner.input_authority(5).unwrap();

        let built = build_request(&token, FieldKey::PlayerName, "Player_2", &on_owner).unwrap();
        assert_eq!(built, request("PlayerName"));

        assert!(matches!(
            build_request(&token, FieldKey::Transform, "x", &on_owner),
            Err(RpcError::FieldNotSettable(_))
        ));

        on_owner.set_input_authority(5, None).unwrap();
        assert!(matches!(
            build_request(&token, FieldKey::PlayerName, "Player_2", &on_owner),
            Err(RpcError::Authority(AuthorityError::RoleNotHeld { .. }))
        ));
    }
}
