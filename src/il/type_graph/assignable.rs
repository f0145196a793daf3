use super::{TypeId, TypeKind};
use crate::util::RefId;
use std::collections::HashSet;

/// Subtyping relationship between types
pub trait Assignable {
    /// Is the first type assignable to the second?
    fn is_assignable(&self, super_type: &Self) -> bool;
}

/// Reference types are assignable if there is a path of base type or interface edges between
/// them. Value types are only assignable to themselves (going from a value type to a reference
/// type requires `box`).
impl<'g> Assignable for TypeId<'g> {
    fn is_assignable(&self, super_type: &TypeId<'g>) -> bool {
        if self == super_type {
            return true;
        }
        if !self.is_reference() || super_type.is_value_type() {
            return false;
        }

        match (self.kind, super_type.kind) {
            // Array covariance only applies to reference element types
            (TypeKind::Array(elem1), TypeKind::Array(elem2)) => {
                elem1.is_reference() && elem1.is_assignable(&elem2)
            }
            (_, TypeKind::Array(_)) => false,

            // Everything reference-typed is an object (interfaces have no base type to walk)
            (_, TypeKind::Class) if super_type.base.is_none() => true,

            _ => is_supertype_reachable(*self, *super_type),
        }
    }
}

/// Search up the base types and interfaces looking for the super type
fn is_supertype_reachable<'g>(sub_type: TypeId<'g>, super_type: TypeId<'g>) -> bool {
    let mut supertypes_to_visit: Vec<TypeId<'g>> = vec![sub_type];
    let mut dont_revisit: HashSet<TypeId<'g>> = HashSet::new();
    dont_revisit.insert(sub_type);

    // Optimization: if the super type is a class, then skip visiting interfaces
    let super_is_class: bool = !super_type.is_interface();

    while let Some(type_data) = supertypes_to_visit.pop() {
        if type_data == super_type {
            return true;
        }
        let type_data = type_data.0;

        if let Some(base) = type_data.base {
            if dont_revisit.insert(base) {
                supertypes_to_visit.push(base);
            }
        }
        if !super_is_class {
            for interface in &type_data.interfaces {
                let interface = RefId(interface);
                if dont_revisit.insert(interface) {
                    supertypes_to_visit.push(interface);
                }
            }
        }
    }

    false
}
