use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A class box on the diagram canvas.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    /// Attribute lines as displayed, e.g. "nombre: String".
    pub attributes: Vec<String>,
    pub position: Position,
}

impl Entity {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            attributes: Vec::new(),
            position,
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Association,
    Inheritance,
    Composition,
    Aggregation,
}

/// Cardinality labels for the two endpoints of a link, e.g. "1" / "0..*".
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Cardinality {
    pub from: String,
    pub to: String,
}

/// A relationship edge between two entities.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Link {
    pub id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub kind: LinkKind,
    pub cardinality: Option<Cardinality>,
    pub name: Option<String>,
}

impl Link {
    pub fn new(from: Uuid, to: Uuid, kind: LinkKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            kind,
            cardinality: None,
            name: None,
        }
    }

    pub fn with_cardinality(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.cardinality = Some(Cardinality {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The whole diagram as replicated between peers. Collections are
/// replaced wholesale on every update; there is no per-field patch format.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Document {
    pub entities: Vec<Entity>,
    pub links: Vec<Link>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when both collections are empty. The join handshake uses this
    /// to decide who answers a state request and who may accept a reply.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.links.is_empty()
    }

    pub fn entity(&self, id: Uuid) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn link(&self, id: Uuid) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }
}
