pub mod add;
pub mod common;
pub mod delete;
pub mod edit;
pub mod folder;
pub mod list;
pub mod pin;
pub mod referral;
pub mod status;
pub mod sync;
pub mod whoami;
