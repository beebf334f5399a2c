//! Message-to-command resolution and execution.
//!
//! Incoming bytes are decoded, resolved 1:1 by tag into a [`Command`], and
//! applied to the world. Every command carries a `from_network` flag:
//!
//! * verbatim state mutations (add / remove / position / parent) re-emit
//!   their own message only when locally originated, so a mutation received
//!   off the wire is never echoed back (loop prevention);
//! * input-style commands (player input, walk, ride) forward the input
//!   itself when locally originated, and produce the derived authoritative
//!   deltas when executed on behalf of a remote sender.
//!
//! Malformed or unmapped messages are logged and dropped; nothing in this
//! module propagates an error to the connection that delivered the bytes.

use crate::nav::Direction;
use crate::protocol::{CodecError, Message};
use crate::world::{GameObject, MoveOutcome, ObjectKind, RidableGrid, WorldModel};
use log::warn;

/// A validated, ready-to-apply world mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PlayerInput {
        direction: u8,
        player_id: u32,
        from_network: bool,
    },
    AddGameObject {
        type_id: u8,
        obj_id: u32,
        from_network: bool,
    },
    RemoveGameObject {
        obj_id: u32,
        from_network: bool,
    },
    GameObjectPosition {
        y: i32,
        x: i32,
        obj_id: u32,
        from_network: bool,
    },
    GameObjectParentObject {
        parent_id: u32,
        obj_id: u32,
        from_network: bool,
    },
    AddRidableObject {
        obj_id: u32,
        mesh_id: u32,
        texture_id: u32,
        grid_height: u8,
        grid_width: u8,
        from_network: bool,
    },
    WalkOnRidableObject {
        walker_id: u32,
        direction: u8,
        from_network: bool,
    },
    RideOnRidableObject {
        vehicle_id: u32,
        rider_id: u32,
        ride_at: u8,
        from_network: bool,
    },
}

impl Command {
    /// Resolves a message to its command, 1:1 by tag. Handshake messages
    /// (Authentication, UdpVerification) belong to the connection layer and
    /// have no command mapping.
    pub fn from_message(message: Message, from_network: bool) -> Option<Command> {
        let command = match message {
            Message::PlayerInput {
                direction,
                player_id,
            } => Command::PlayerInput {
                direction,
                player_id,
                from_network,
            },
            Message::AddGameObject { type_id, obj_id } => Command::AddGameObject {
                type_id,
                obj_id,
                from_network,
            },
            Message::RemoveGameObject { obj_id } => Command::RemoveGameObject {
                obj_id,
                from_network,
            },
            Message::GameObjectPosition { y, x, obj_id } => Command::GameObjectPosition {
                y,
                x,
                obj_id,
                from_network,
            },
            Message::GameObjectParentObject { parent_id, obj_id } => {
                Command::GameObjectParentObject {
                    parent_id,
                    obj_id,
                    from_network,
                }
            }
            Message::AddRidableObject {
                obj_id,
                mesh_id,
                texture_id,
                grid_height,
                grid_width,
            } => Command::AddRidableObject {
                obj_id,
                mesh_id,
                texture_id,
                grid_height,
                grid_width,
                from_network,
            },
            Message::WalkOnRidableObject {
                walker_id,
                direction,
            } => Command::WalkOnRidableObject {
                walker_id,
                direction,
                from_network,
            },
            Message::RideOnRidableObject {
                vehicle_id,
                rider_id,
                ride_at,
            } => Command::RideOnRidableObject {
                vehicle_id,
                rider_id,
                ride_at,
                from_network,
            },
            Message::Authentication { .. } | Message::UdpVerification { .. } => return None,
        };
        Some(command)
    }

    /// Applies the command, returning the messages to hand to the transport
    /// layer. Always leaves the world in a valid state; logical failures
    /// are logged inside the mutators and become an empty result.
    pub fn execute(self, world: &mut WorldModel) -> Vec<Message> {
        match self {
            Command::PlayerInput {
                direction,
                player_id,
                from_network,
            } => {
                if !from_network {
                    // Movement is server-authoritative: a local input is
                    // forwarded, never applied speculatively.
                    return vec![Message::PlayerInput {
                        direction,
                        player_id,
                    }];
                }
                let Some(direction) = Direction::from_u8(direction) else {
                    warn!("player input with invalid direction {}", direction);
                    return Vec::new();
                };
                match world.take_action(player_id, direction) {
                    Some(outcome) => movement_deltas(&outcome),
                    None => Vec::new(),
                }
            }

            Command::WalkOnRidableObject {
                walker_id,
                direction,
                from_network,
            } => {
                if !from_network {
                    return vec![Message::WalkOnRidableObject {
                        walker_id,
                        direction,
                    }];
                }
                let Some(direction) = Direction::from_u8(direction) else {
                    warn!("walk with invalid direction {}", direction);
                    return Vec::new();
                };
                match world.walk(walker_id, direction) {
                    Some(outcome) => movement_deltas(&outcome),
                    None => Vec::new(),
                }
            }

            Command::RideOnRidableObject {
                vehicle_id,
                rider_id,
                ride_at,
                from_network,
            } => {
                if !from_network {
                    return vec![Message::RideOnRidableObject {
                        vehicle_id,
                        rider_id,
                        ride_at,
                    }];
                }
                match world.ride_on(vehicle_id, rider_id, ride_at) {
                    Some(outcome) => movement_deltas(&outcome),
                    None => Vec::new(),
                }
            }

            Command::AddGameObject {
                type_id,
                obj_id,
                from_network,
            } => {
                let Some(kind) = ObjectKind::from_type_id(type_id) else {
                    warn!("add object {} with unknown type id {}", obj_id, type_id);
                    return Vec::new();
                };
                if !world.insert(GameObject::new(obj_id, kind)) {
                    return Vec::new();
                }
                echo(from_network, Message::AddGameObject { type_id, obj_id })
            }

            Command::AddRidableObject {
                obj_id,
                mesh_id,
                texture_id,
                grid_height,
                grid_width,
                from_network,
            } => {
                let Some(grid) = RidableGrid::new(grid_height, grid_width) else {
                    warn!(
                        "add ridable {} with degenerate grid {}x{}",
                        obj_id, grid_height, grid_width
                    );
                    return Vec::new();
                };
                let mut object = GameObject::new(obj_id, ObjectKind::Ridable(grid));
                object.mesh_id = mesh_id;
                object.texture_id = texture_id;
                if !world.insert(object) {
                    return Vec::new();
                }
                echo(
                    from_network,
                    Message::AddRidableObject {
                        obj_id,
                        mesh_id,
                        texture_id,
                        grid_height,
                        grid_width,
                    },
                )
            }

            Command::RemoveGameObject {
                obj_id,
                from_network,
            } => {
                if !world.remove(obj_id) {
                    return Vec::new();
                }
                echo(from_network, Message::RemoveGameObject { obj_id })
            }

            Command::GameObjectPosition {
                y,
                x,
                obj_id,
                from_network,
            } => {
                if !world.update_position(obj_id, crate::nav::Coord::new(y, x)) {
                    return Vec::new();
                }
                echo(from_network, Message::GameObjectPosition { y, x, obj_id })
            }

            Command::GameObjectParentObject {
                parent_id,
                obj_id,
                from_network,
            } => {
                if !world.set_parent(obj_id, parent_id) {
                    return Vec::new();
                }
                echo(
                    from_network,
                    Message::GameObjectParentObject { parent_id, obj_id },
                )
            }
        }
    }
}

/// Suppresses re-emission for network-sourced mutations.
fn echo(from_network: bool, message: Message) -> Vec<Message> {
    if from_network {
        Vec::new()
    } else {
        vec![message]
    }
}

/// Derived broadcast deltas for a completed movement.
fn movement_deltas(outcome: &MoveOutcome) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if let Some(parent_id) = outcome.new_parent {
        messages.push(Message::GameObjectParentObject {
            parent_id,
            obj_id: outcome.object_id,
        });
    }
    messages.push(Message::GameObjectPosition {
        y: outcome.position.y,
        x: outcome.position.x,
        obj_id: outcome.object_id,
    });
    messages
}

/// Decodes one payload and runs it through the pipeline. Decode and resolve
/// failures are logged and swallowed; a malformed packet must never crash
/// the connection that carried it.
pub fn handle_incoming(bytes: &[u8], world: &mut WorldModel, from_network: bool) -> Vec<Message> {
    let message = match Message::decode(bytes) {
        Ok(message) => message,
        Err(CodecError::UnknownType(tag)) => {
            warn!("dropping message with unknown tag {}", tag);
            return Vec::new();
        }
        Err(error) => {
            warn!("dropping undecodable message: {}", error);
            return Vec::new();
        }
    };

    let Some(command) = Command::from_message(message, from_network) else {
        warn!("no command handler for message, dropped");
        return Vec::new();
    };

    command.execute(world)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::{Coord, ParallelTransporter};

    fn flat_world(height: i32, width: i32) -> WorldModel {
        WorldModel::with_region(ParallelTransporter::new(height, width)).unwrap()
    }

    #[test]
    fn player_input_from_network_moves_exactly_once() {
        let mut world = flat_world(4, 4);
        let (player, spawn) = world.spawn_player(0, 0).unwrap();
        assert_eq!(spawn, Coord::new(0, 0));

        let bytes = Message::PlayerInput {
            direction: Direction::Up as u8,
            player_id: player,
        }
        .encode();
        let out = handle_incoming(&bytes, &mut world, true);

        assert_eq!(world.get(player).unwrap().pos, Coord::new(3, 0));
        assert_eq!(
            out,
            vec![Message::GameObjectPosition {
                y: 3,
                x: 0,
                obj_id: player,
            }]
        );
    }

    #[test]
    fn local_input_is_forwarded_not_applied() {
        let mut world = flat_world(4, 4);
        let (player, spawn) = world.spawn_player(0, 0).unwrap();

        let command = Command::PlayerInput {
            direction: Direction::Down as u8,
            player_id: player,
            from_network: false,
        };
        let out = command.execute(&mut world);

        assert_eq!(world.get(player).unwrap().pos, spawn);
        assert_eq!(
            out,
            vec![Message::PlayerInput {
                direction: Direction::Down as u8,
                player_id: player,
            }]
        );
    }

    #[test]
    fn network_mutations_are_never_echoed() {
        let mut world = flat_world(4, 4);
        let add = Command::AddGameObject {
            type_id: 1,
            obj_id: 50,
            from_network: true,
        };
        assert!(add.execute(&mut world).is_empty());
        assert!(world.get(50).is_some());

        let position = Command::GameObjectPosition {
            y: 2,
            x: 1,
            obj_id: 50,
            from_network: true,
        };
        assert!(position.execute(&mut world).is_empty());

        let remove = Command::RemoveGameObject {
            obj_id: 50,
            from_network: true,
        };
        assert!(remove.execute(&mut world).is_empty());
        assert!(world.get(50).is_none());
    }

    #[test]
    fn local_mutations_are_forwarded() {
        let mut world = flat_world(4, 4);
        let add = Command::AddGameObject {
            type_id: 1,
            obj_id: 50,
            from_network: false,
        };
        assert_eq!(
            add.execute(&mut world),
            vec![Message::AddGameObject {
                type_id: 1,
                obj_id: 50,
            }]
        );
    }

    #[test]
    fn boarding_emits_parent_then_position() {
        let mut world = flat_world(1, 4);
        let (player, _) = world.spawn_player(0, 0).unwrap();
        let vehicle = world.allocate_id();
        let grid = RidableGrid::new(2, 2).unwrap();
        world.insert(GameObject::new(vehicle, ObjectKind::Ridable(grid)));
        let root = world.root_id();
        assert!(world.update_position(vehicle, Coord::new(0, 1)));
        assert!(world.set_parent(vehicle, root));

        let command = Command::PlayerInput {
            direction: Direction::Right as u8,
            player_id: player,
            from_network: true,
        };
        let out = command.execute(&mut world);

        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            Message::GameObjectParentObject { parent_id, obj_id }
                if parent_id == vehicle && obj_id == player
        ));
        assert!(matches!(out[1], Message::GameObjectPosition { .. }));
    }

    #[test]
    fn blocked_movement_produces_no_output() {
        let mut world = flat_world(1, 2);
        let (a, _) = world.spawn_player(0, 0).unwrap();
        let (_b, _) = world.spawn_player(0, 0).unwrap();

        let command = Command::PlayerInput {
            direction: Direction::Right as u8,
            player_id: a,
            from_network: true,
        };
        assert!(command.execute(&mut world).is_empty());
    }

    #[test]
    fn invalid_direction_is_dropped() {
        let mut world = flat_world(2, 2);
        let (player, spawn) = world.spawn_player(0, 0).unwrap();
        let command = Command::PlayerInput {
            direction: 9,
            player_id: player,
            from_network: true,
        };
        assert!(command.execute(&mut world).is_empty());
        assert_eq!(world.get(player).unwrap().pos, spawn);
    }

    #[test]
    fn handshake_messages_have_no_command_mapping() {
        assert!(Command::from_message(
            Message::Authentication {
                protocol_version: 1,
                client_id: 1,
                udp_port: 1,
                token: Vec::new(),
            },
            true
        )
        .is_none());
        assert!(Command::from_message(
            Message::UdpVerification {
                session_id: 1,
                verification_code: 2,
                timestamp: 3,
            },
            true
        )
        .is_none());
    }

    #[test]
    fn malformed_bytes_are_swallowed() {
        let mut world = flat_world(2, 2);
        assert!(handle_incoming(&[], &mut world, true).is_empty());
        assert!(handle_incoming(&[250, 1, 2], &mut world, true).is_empty());
        assert!(handle_incoming(&[0, 1], &mut world, true).is_empty());
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn degenerate_ridable_grid_is_rejected() {
        let mut world = flat_world(2, 2);
        let command = Command::AddRidableObject {
            obj_id: 9,
            mesh_id: 0,
            texture_id: 0,
            grid_height: 0,
            grid_width: 4,
            from_network: true,
        };
        assert!(command.execute(&mut world).is_empty());
        assert!(world.get(9).is_none());
    }
}
