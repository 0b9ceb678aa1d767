//! Canned lifecycle events for tests.

use user_sync_core::event::{Action, BusinessInfo, UserLifecycleEvent};

/// Email of the fixture user.
pub const ALICE_EMAIL: &str = "alice@example.com";

/// Upstream id of the fixture user.
pub const ALICE_ID: &str = "8c1f6a52-0d0b-4f6e-9f7a-3b9a1d2c4e01";

/// CREATE for Alice with names, phone, credential and a business.
#[must_use]
pub fn alice_create() -> UserLifecycleEvent {
    UserLifecycleEvent::new(Action::Create, ALICE_ID, "2025-03-14T09:26:53Z")
        .with_email(ALICE_EMAIL)
        .with_name("Alice", "Smith")
        .with_phone("+32 470 12 34 56")
        .with_credential("$2y$10$abcdefghijklmnopqrstuv")
        .with_business(acme())
}

/// UPDATE for Alice changing only the phone number.
#[must_use]
pub fn alice_update_phone(phone: &str) -> UserLifecycleEvent {
    UserLifecycleEvent::new(Action::Update, ALICE_ID, "2025-03-15T10:00:00Z")
        .with_email(ALICE_EMAIL)
        .with_phone(phone)
}

/// DELETE for Alice.
#[must_use]
pub fn alice_delete() -> UserLifecycleEvent {
    UserLifecycleEvent::new(Action::Delete, ALICE_ID, "2025-03-16T11:00:00Z").with_email(ALICE_EMAIL)
}

/// A fully populated business record.
#[must_use]
pub fn acme() -> BusinessInfo {
    BusinessInfo {
        business_name: Some("Acme BV".to_string()),
        business_email: Some("billing@acme.example".to_string()),
        real_address: Some("Nijverheidskaai 170, 1070 Anderlecht".to_string()),
        vat_number: Some("BE0123456789".to_string()),
        billing_address: Some("Postbus 12, 1000 Brussel".to_string()),
    }
}
