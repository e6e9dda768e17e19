//! Database entities

pub mod session;

pub use session::Entity as Session;

pub mod prelude {
    pub use super::session::Entity as Session;
}
