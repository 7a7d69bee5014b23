//! Discriminant-driven decoding
//!
//! Some native APIs fill one output buffer whose shape depends on an input
//! selector. A `VariantTable` maps each selector value to the descriptor
//! (or raw decode routine) that interprets the buffer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::descriptor::TypeDescriptor;
use crate::error::{MarshalError, MarshalResult};
use crate::value::ManagedValue;

use super::decode::Decoder;

/// Transform applied to a typed decode, e.g. mapping an enum to its name
pub type PostProcess = Arc<dyn Fn(ManagedValue) -> MarshalResult<ManagedValue> + Send + Sync>;

/// Decode routine for shapes no descriptor captures
pub type RawDecode =
    Arc<dyn Fn(&Decoder<'_>, &[u8]) -> MarshalResult<ManagedValue> + Send + Sync>;

#[derive(Clone)]
pub enum VariantShape {
    Typed {
        descriptor: TypeDescriptor,
        post: Option<PostProcess>,
    },
    Raw(RawDecode),
}

impl fmt::Debug for VariantShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantShape::Typed { descriptor, post } => f
                .debug_struct("Typed")
                .field("descriptor", descriptor)
                .field("post", &post.is_some())
                .finish(),
            VariantShape::Raw(_) => f.write_str("Raw"),
        }
    }
}

/// Discriminant -> shape table
#[derive(Debug, Clone)]
pub struct VariantTable {
    name: String,
    shapes: BTreeMap<u32, VariantShape>,
}

impl VariantTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shapes: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(mut self, discriminant: u32, descriptor: TypeDescriptor) -> Self {
        self.shapes.insert(
            discriminant,
            VariantShape::Typed {
                descriptor,
                post: None,
            },
        );
        self
    }

    pub fn register_with_post<F>(mut self, discriminant: u32, descriptor: TypeDescriptor, post: F) -> Self
    where
        F: Fn(ManagedValue) -> MarshalResult<ManagedValue> + Send + Sync + 'static,
    {
        self.shapes.insert(
            discriminant,
            VariantShape::Typed {
                descriptor,
                post: Some(Arc::new(post)),
            },
        );
        self
    }

    pub fn register_raw<F>(mut self, discriminant: u32, decode: F) -> Self
    where
        F: Fn(&Decoder<'_>, &[u8]) -> MarshalResult<ManagedValue> + Send + Sync + 'static,
    {
        self.shapes.insert(discriminant, VariantShape::Raw(Arc::new(decode)));
        self
    }

    pub fn get(&self, discriminant: u32) -> Option<&VariantShape> {
        self.shapes.get(&discriminant)
    }

    /// Registered discriminants in ascending order
    pub fn discriminants(&self) -> impl Iterator<Item = u32> + '_ {
        self.shapes.keys().copied()
    }

    /// Decode `source` with the shape registered for `discriminant`
    pub fn decode(
        &self,
        decoder: &Decoder<'_>,
        source: &[u8],
        discriminant: u32,
    ) -> MarshalResult<ManagedValue> {
        let shape = self
            .shapes
            .get(&discriminant)
            .ok_or_else(|| MarshalError::UnsupportedDiscriminant {
                table: self.name.clone(),
                discriminant,
            })?;
        log::debug!(
            "[variant] {} discriminant {} over {} bytes",
            self.name,
            discriminant,
            source.len()
        );
        match shape {
            VariantShape::Typed { descriptor, post } => {
                let value = decoder.decode(source, descriptor, 0)?;
                match post {
                    Some(post) => post(value),
                    None => Ok(value),
                }
            }
            VariantShape::Raw(decode) => decode(decoder, source),
        }
    }
}
