//! Grid topology and orientation transport.
//!
//! A [`ParallelTransporter`] describes how an agent moves between cells of a
//! rectangular grid. Unconfigured cells behave as a flat torus: direction
//! lookups wrap modulo the grid dimensions and the agent's facing is left
//! unchanged. Explicitly linked cells ("seams") send the agent to an
//! arbitrary destination cell and apply a quarter-turn rotation class to its
//! facing, which is how folded topologies such as a cube surface are stored
//! in flat 2D coordinates.

use std::collections::HashMap;

/// The four cardinal directions, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Right = 0,
    Up = 1,
    Left = 2,
    Down = 3,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Right,
        Direction::Up,
        Direction::Left,
        Direction::Down,
    ];

    pub fn from_u8(value: u8) -> Option<Direction> {
        match value {
            0 => Some(Direction::Right),
            1 => Some(Direction::Up),
            2 => Some(Direction::Left),
            3 => Some(Direction::Down),
            _ => None,
        }
    }

    /// Unit step in grid coordinates. Up decreases y, Down increases y.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::Right => (0, 1),
            Direction::Up => (-1, 0),
            Direction::Left => (0, -1),
            Direction::Down => (1, 0),
        }
    }
}

/// Orientation-rotation class applied to an agent's facing when it crosses
/// a cell boundary. Composition is modulo-4 addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rotation {
    Straight = 0,
    TurnLeft = 1,
    Reverse = 2,
    TurnRight = 3,
}

impl Rotation {
    pub fn from_u8(value: u8) -> Option<Rotation> {
        match value {
            0 => Some(Rotation::Straight),
            1 => Some(Rotation::TurnLeft),
            2 => Some(Rotation::Reverse),
            3 => Some(Rotation::TurnRight),
            _ => None,
        }
    }

    /// Rotates a direction by this class.
    pub fn apply(self, direction: Direction) -> Direction {
        let turned = (direction as u8 + self as u8) % 4;
        Direction::from_u8(turned).unwrap()
    }

    /// Composes two rotation classes.
    pub fn then(self, other: Rotation) -> Rotation {
        Rotation::from_u8((self as u8 + other as u8) % 4).unwrap()
    }
}

/// A cell coordinate. Matches the wire's signed 32-bit position fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coord {
    pub y: i32,
    pub x: i32,
}

impl Coord {
    pub fn new(y: i32, x: i32) -> Coord {
        Coord { y, x }
    }
}

/// Result of a single navigation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavInfo {
    /// Destination cell.
    pub position: Coord,
    /// Facing after the step's rotation class was applied.
    pub facing: Direction,
    /// The raw rotation class applied, so callers can update body
    /// orientation independently of facing.
    pub rotation: Rotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seam {
    dest: Coord,
    rotation: Rotation,
}

/// Per-cell direction-to-destination map with orientation transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelTransporter {
    height: i32,
    width: i32,
    seams: HashMap<(Coord, Direction), Seam>,
}

impl ParallelTransporter {
    /// A plain toroidal grid with no seams.
    pub fn new(height: i32, width: i32) -> ParallelTransporter {
        assert!(height > 0 && width > 0, "grid dimensions must be positive");
        ParallelTransporter {
            height,
            width,
            seams: HashMap::new(),
        }
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn contains(&self, coord: Coord) -> bool {
        coord.y >= 0 && coord.y < self.height && coord.x >= 0 && coord.x < self.width
    }

    /// Installs a one-way seam: stepping `direction` out of `from` arrives
    /// at `dest` with `rotation` applied to the agent's facing.
    pub fn link(&mut self, from: Coord, direction: Direction, dest: Coord, rotation: Rotation) {
        debug_assert!(self.contains(from) && self.contains(dest));
        self.seams.insert((from, direction), Seam { dest, rotation });
    }

    /// One navigation step from `position` moving `moving` while facing
    /// `facing`. Returns `None` if `position` lies outside the grid;
    /// out-of-range input is rejected, never wrapped.
    pub fn move_from(&self, position: Coord, moving: Direction, facing: Direction) -> Option<NavInfo> {
        if !self.contains(position) {
            return None;
        }

        let info = match self.seams.get(&(position, moving)) {
            Some(seam) => NavInfo {
                position: seam.dest,
                facing: seam.rotation.apply(facing),
                rotation: seam.rotation,
            },
            None => {
                let (dy, dx) = moving.offset();
                NavInfo {
                    position: Coord {
                        y: (position.y + dy).rem_euclid(self.height),
                        x: (position.x + dx).rem_euclid(self.width),
                    },
                    facing,
                    rotation: Rotation::Straight,
                }
            }
        };

        Some(info)
    }
}

/// Builds the folded cube-surface topology on a `3S x 4S` strip.
///
/// The middle row band `[S, 2S)` holds the four lateral faces side by side
/// (face `f` at columns `[f*S, (f+1)*S)`); the top base occupies rows
/// `[0, S)` and the bottom base rows `[2S, 3S)`, both at columns `[0, S)`.
/// Every seam is wired in both directions with the compensating rotation
/// class, so crossing a seam and stepping straight back is the identity and
/// the only non-identity holonomy sits at the cube's corners, by
/// construction rather than by accident.
pub fn cube_figure(size: i32) -> ParallelTransporter {
    assert!(size > 0, "figure size must be positive");
    let s = size;
    let mut t = ParallelTransporter::new(3 * s, 4 * s);

    for c in 0..s {
        // Face 0 (front) joins the top base's bottom edge and the bottom
        // base's top edge without any reorientation.
        t.link(Coord::new(s, c), Direction::Up, Coord::new(s - 1, c), Rotation::Straight);
        t.link(Coord::new(s - 1, c), Direction::Down, Coord::new(s, c), Rotation::Straight);
        t.link(Coord::new(2 * s - 1, c), Direction::Down, Coord::new(2 * s, c), Rotation::Straight);
        t.link(Coord::new(2 * s, c), Direction::Up, Coord::new(2 * s - 1, c), Rotation::Straight);

        // Face 1 (right) joins the bases' right edges.
        t.link(
            Coord::new(s, s + c),
            Direction::Up,
            Coord::new(s - 1 - c, s - 1),
            Rotation::TurnLeft,
        );
        t.link(
            Coord::new(c, s - 1),
            Direction::Right,
            Coord::new(s, s + (s - 1 - c)),
            Rotation::TurnRight,
        );
        t.link(
            Coord::new(2 * s - 1, s + c),
            Direction::Down,
            Coord::new(2 * s + c, s - 1),
            Rotation::TurnRight,
        );
        t.link(
            Coord::new(2 * s + c, s - 1),
            Direction::Right,
            Coord::new(2 * s - 1, s + c),
            Rotation::TurnLeft,
        );

        // Face 2 (back) joins the bases' far edges, column order reversed.
        t.link(
            Coord::new(s, 2 * s + c),
            Direction::Up,
            Coord::new(0, s - 1 - c),
            Rotation::Reverse,
        );
        t.link(
            Coord::new(0, c),
            Direction::Up,
            Coord::new(s, 2 * s + (s - 1 - c)),
            Rotation::Reverse,
        );
        t.link(
            Coord::new(2 * s - 1, 2 * s + c),
            Direction::Down,
            Coord::new(3 * s - 1, s - 1 - c),
            Rotation::Reverse,
        );
        t.link(
            Coord::new(3 * s - 1, c),
            Direction::Down,
            Coord::new(2 * s - 1, 2 * s + (s - 1 - c)),
            Rotation::Reverse,
        );

        // Face 3 (left) joins the bases' left edges.
        t.link(
            Coord::new(s, 3 * s + c),
            Direction::Up,
            Coord::new(c, 0),
            Rotation::TurnRight,
        );
        t.link(
            Coord::new(c, 0),
            Direction::Left,
            Coord::new(s, 3 * s + c),
            Rotation::TurnLeft,
        );
        t.link(
            Coord::new(2 * s - 1, 3 * s + c),
            Direction::Down,
            Coord::new(3 * s - 1 - c, 0),
            Rotation::TurnLeft,
        );
        t.link(
            Coord::new(2 * s + c, 0),
            Direction::Left,
            Coord::new(2 * s - 1, 3 * s + (s - 1 - c)),
            Rotation::TurnRight,
        );
    }

    t
}
