use super::{FieldId, MethodId, TypeGraph, TypeId};
use crate::il::Error;
use crate::util::RefId;

/// Everything the emitter needs to know in order to call a method
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberSignature<'g> {
    pub parameter_types: Vec<TypeId<'g>>,

    /// `None` for `void`
    pub return_type: Option<TypeId<'g>>,

    pub is_static: bool,
    pub is_virtual: bool,
    pub declaring_type_is_value_type: bool,
}

/// Turn symbolic references into handles
///
/// Resolution is a pure lookup, and it always happens before anything is emitted: a failure here
/// never leaves a half-emitted call behind.
pub trait MemberResolver<'g> {
    fn resolve_type(&self, name: &str) -> Result<TypeId<'g>, Error>;

    fn resolve_field(&self, owner: TypeId<'g>, name: &str) -> Result<FieldId<'g>, Error>;

    /// Find a method by name, optionally disambiguating overloads with parameter types
    fn resolve_method(
        &self,
        owner: TypeId<'g>,
        name: &str,
        parameter_types: Option<&[TypeId<'g>]>,
    ) -> Result<MethodId<'g>, Error>;
}

impl<'g> MemberResolver<'g> for TypeGraph<'g> {
    fn resolve_type(&self, name: &str) -> Result<TypeId<'g>, Error> {
        self.lookup_type(name)
            .ok_or_else(|| Error::MissingType(name.to_owned()))
    }

    /// Fields are searched for on the type and then up its base types
    fn resolve_field(&self, owner: TypeId<'g>, name: &str) -> Result<FieldId<'g>, Error> {
        let mut next_type = Some(owner);
        while let Some(type_data) = next_type {
            if let Some(field) = type_data.0.fields.iter().find(|f| f.name == name) {
                return Ok(RefId(field));
            }
            next_type = type_data.base;
        }
        Err(Error::MissingMember(format!("{}::{}", owner.name, name)))
    }

    fn resolve_method(
        &self,
        owner: TypeId<'g>,
        name: &str,
        parameter_types: Option<&[TypeId<'g>]>,
    ) -> Result<MethodId<'g>, Error> {
        let mut next_type = Some(owner);
        while let Some(type_data) = next_type {
            let candidates: Vec<MethodId<'g>> = type_data
                .0
                .methods
                .iter()
                .filter(|m| m.name == name)
                .filter(|m| match parameter_types {
                    Some(parameter_types) => m.parameters == parameter_types,
                    None => true,
                })
                .map(RefId)
                .collect();

            match candidates.as_slice() {
                [] => next_type = type_data.base,
                [method] => return Ok(*method),
                _ => {
                    return Err(Error::AmbiguousMethod(
                        format!("{}::{}", owner.name, name),
                        candidates.len(),
                    ))
                }
            }
        }
        Err(Error::MissingMember(format!("{}::{}", owner.name, name)))
    }
}
