//! Names of the types and members generated for one method.
//!
//! Two schemes are supported. Anonymous names mimic what a C# compiler emits for lambdas,
//! anonymous types and `async` methods; they contain characters no source language accepts,
//! so they can never collide with user code. Plain names are derived from the method token
//! and are easier to read in a decompiler.

use crate::{
    analysis::VariableId,
    metadata::{method::MethodDef, token::Token},
};

/// State field of the state machine
pub const STATE_FIELD: &str = "<>1__state";
/// Method builder field of the state machine
pub const BUILDER_FIELD: &str = "<>t__builder";
/// Field buffering the outcome of a conditional suspension point
pub const CONDITION_FIELD: &str = "<>s__1";
/// Field holding the receiver of an instance method
pub const THIS_FIELD: &str = "<>4__this";
/// Field of the state machine holding the frame of the running invocation
pub const FRAME_FIELD: &str = "<x>5__1";
/// Field of an awaiter referencing the frame
pub const AWAITER_FRAME_FIELD: &str = "Frame";

/// Name generator for the artifacts of one transformed method
#[derive(Debug, Clone)]
pub struct Naming {
    anonymous: bool,
    rid: u32,
    token: Token,
    method: String,
}

impl Naming {
    /// Creates the names for `method`
    #[must_use]
    pub fn new(anonymous: bool, method: &MethodDef) -> Self {
        Naming {
            anonymous,
            rid: method.token.row(),
            token: method.token,
            method: method.name.clone(),
        }
    }

    /// Returns `true` if compiler-style names are generated
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// The frame class
    #[must_use]
    pub fn frame(&self) -> String {
        if self.anonymous {
            format!("<>AnonType_{}_Frame", self.rid)
        } else {
            format!("Frame_{:08X}", self.token.value())
        }
    }

    /// The awaiter of suspension point `id`
    #[must_use]
    pub fn awaiter(&self, id: usize) -> String {
        if self.anonymous {
            format!("<>AnonType_{}_{id:X}", self.rid)
        } else {
            format!("Awaiter_{:08X}_{id:X}", self.token.value())
        }
    }

    /// The static class holding the `GetAwaiter` extension methods
    #[must_use]
    pub fn container(&self) -> String {
        if self.anonymous {
            format!("<>AnonType_{}", self.rid)
        } else {
            format!("Extensions_{:08X}", self.token.value())
        }
    }

    /// The state machine struct
    #[must_use]
    pub fn state_machine(&self) -> String {
        if self.anonymous {
            format!("<{}>d__{}", self.method, self.rid)
        } else {
            format!("StateMachine_{}_{}", self.method, self.rid)
        }
    }

    /// The task-returning proxy of a value-returning method
    #[must_use]
    pub fn proxy(&self) -> String {
        format!("<{0}>g__{0}Async|{1}_0", self.method, self.rid)
    }

    /// The state machine field parking the awaiter of suspension point `id`
    #[must_use]
    pub fn awaiter_slot(id: usize) -> String {
        format!("<>u__{}", id + 1)
    }

    /// The frame field backing local `index`
    #[must_use]
    pub fn local_field(index: usize) -> String {
        format!("<l>5__{index}")
    }

    /// The frame field backing a synthetic variable
    #[must_use]
    pub fn variable_field(var: VariableId) -> String {
        format!("<>s__{}", var.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::{MethodSignature, TypeSignature};

    fn method() -> MethodDef {
        let mut def = MethodDef::new(
            "Compute",
            MethodSignature::new_static(TypeSignature::I4, vec![]),
        );
        def.token = Token::from_parts(Token::METHOD_DEF, 0x1c);
        def
    }

    #[test]
    fn anonymous_names() {
        let naming = Naming::new(true, &method());
        assert_eq!(naming.frame(), "<>AnonType_28_Frame");
        assert_eq!(naming.awaiter(10), "<>AnonType_28_A");
        assert_eq!(naming.container(), "<>AnonType_28");
        assert_eq!(naming.state_machine(), "<Compute>d__28");
        assert_eq!(naming.proxy(), "<Compute>g__ComputeAsync|28_0");
    }

    #[test]
    fn plain_names() {
        let naming = Naming::new(false, &method());
        assert!(!naming.is_anonymous());
        assert_eq!(naming.frame(), "Frame_0600001C");
        assert_eq!(naming.awaiter(31), "Awaiter_0600001C_1F");
        assert_eq!(naming.container(), "Extensions_0600001C");
        assert_eq!(naming.state_machine(), "StateMachine_Compute_28");
        assert_eq!(naming.proxy(), "<Compute>g__ComputeAsync|28_0");
    }

    #[test]
    fn member_names() {
        assert_eq!(Naming::awaiter_slot(0), "<>u__1");
        assert_eq!(Naming::local_field(3), "<l>5__3");
        assert_eq!(Naming::variable_field(VariableId(12)), "<>s__12");
    }
}
