//! XML wire codec for [`UserLifecycleEvent`].
//!
//! Events travel as a flat, ordered element list inside a `UserMessage` envelope, with
//! the business sub-record nested in a `Business` group:
//!
//! ```text
//! <UserMessage>
//!   <ActionType>CREATE</ActionType>
//!   <UUID>42</UUID>
//!   <TimeOfAction>2025-01-01T00:00:00Z</TimeOfAction>
//!   <EncryptedPassword>$P$B...</EncryptedPassword>
//!   <FirstName>Alice</FirstName>
//!   <LastName>Smith</LastName>
//!   <PhoneNumber>+32 470 00 00 00</PhoneNumber>
//!   <EmailAddress>alice@example.com</EmailAddress>
//!   <Business>
//!     <BusinessName>Acme</BusinessName>
//!     ...
//!   </Business>
//! </UserMessage>
//! ```
//!
//! Producers have used more than one element name for the same field over time
//! (`EmailAddress` and `Email`, `BTWNumber` and `VATNumber`, ...). The accepted names
//! live in one versioned [`AliasTable`]; decoding tries each field's aliases in order
//! and takes the first one present. Encoding always writes the first (canonical) alias.
//!
//! Decoding only fails when the envelope or the `ActionType` cannot be found or the
//! document is not well-formed XML. Every other element is optional.

use crate::event::{Action, BusinessInfo, UserLifecycleEvent};
use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use std::fmt::Write as _;
use thiserror::Error;

/// MIME type advertised for encoded events.
pub const CONTENT_TYPE: &str = "text/xml";

/// Errors produced while decoding an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A required structural element could not be located, or the XML is not well-formed.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The `ActionType` element holds something other than CREATE/UPDATE/DELETE.
    #[error("Malformed event: unknown action `{0}`")]
    UnknownAction(String),
}

/// Priority-ordered element names accepted for every field of the wire format.
///
/// The first alias of each list is the canonical name used when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasTable {
    /// Revision of the table. Bump when aliases are added or reordered.
    pub version: u32,
    /// Root element.
    pub envelope: &'static [&'static str],
    /// Lifecycle action.
    pub action: &'static [&'static str],
    /// Upstream user identifier.
    pub user_id: &'static [&'static str],
    /// Timestamp of the originating action.
    pub action_time: &'static [&'static str],
    /// Pre-hashed credential.
    pub credential: &'static [&'static str],
    /// Given name.
    pub first_name: &'static [&'static str],
    /// Family name.
    pub last_name: &'static [&'static str],
    /// Phone number.
    pub phone_number: &'static [&'static str],
    /// Email address.
    pub email: &'static [&'static str],
    /// Business group element.
    pub business: &'static [&'static str],
    /// Business name inside the group.
    pub business_name: &'static [&'static str],
    /// Business email inside the group.
    pub business_email: &'static [&'static str],
    /// Physical address inside the group.
    pub real_address: &'static [&'static str],
    /// VAT number inside the group.
    pub vat_number: &'static [&'static str],
    /// Billing address inside the group.
    pub billing_address: &'static [&'static str],
}

/// First revision: the names the original producers emitted.
pub const ALIASES_V1: AliasTable = AliasTable {
    version: 1,
    envelope: &["UserMessage"],
    action: &["ActionType"],
    user_id: &["UUID", "UserID"],
    action_time: &["TimeOfAction"],
    credential: &["EncryptedPassword"],
    first_name: &["FirstName"],
    last_name: &["LastName"],
    phone_number: &["PhoneNumber"],
    email: &["EmailAddress"],
    business: &["Business"],
    business_name: &["BusinessName"],
    business_email: &["BusinessEmail"],
    real_address: &["RealAddress"],
    vat_number: &["BTWNumber"],
    billing_address: &["FacturationAddress"],
};

/// Current revision, adds the alternative spellings seen from later producers.
pub const ALIASES_V2: AliasTable = AliasTable {
    version: 2,
    envelope: &["UserMessage", "User"],
    action: &["ActionType"],
    user_id: &["UUID", "UserID", "UserId"],
    action_time: &["TimeOfAction", "ActionTime"],
    credential: &["EncryptedPassword", "Password"],
    first_name: &["FirstName"],
    last_name: &["LastName"],
    phone_number: &["PhoneNumber", "Phone"],
    email: &["EmailAddress", "Email"],
    business: &["Business"],
    business_name: &["BusinessName"],
    business_email: &["BusinessEmail"],
    real_address: &["RealAddress"],
    vat_number: &["BTWNumber", "VATNumber"],
    billing_address: &["FacturationAddress", "BillingAddress"],
};

impl Default for AliasTable {
    fn default() -> Self {
        ALIASES_V2
    }
}

/// Encoder/decoder for the XML wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlCodec {
    aliases: AliasTable,
}

impl XmlCodec {
    /// Codec using the current alias table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            aliases: ALIASES_V2,
        }
    }

    /// Codec using a specific alias table revision.
    #[must_use]
    pub const fn with_aliases(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    /// Alias table in use.
    #[must_use]
    pub const fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Encode an event as an XML document.
    #[must_use]
    pub fn encode(&self, event: &UserLifecycleEvent) -> String {
        let a = &self.aliases;
        let root = canonical(a.envelope);
        let mut out = String::with_capacity(512);
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        open(&mut out, root);

        leaf(&mut out, canonical(a.action), Some(event.action.as_str()));
        leaf(&mut out, canonical(a.user_id), Some(&event.user_id));
        leaf(&mut out, canonical(a.action_time), Some(&event.action_time));
        leaf(&mut out, canonical(a.credential), event.credential.as_deref());
        leaf(&mut out, canonical(a.first_name), event.first_name.as_deref());
        leaf(&mut out, canonical(a.last_name), event.last_name.as_deref());
        leaf(&mut out, canonical(a.phone_number), event.phone_number.as_deref());
        leaf(&mut out, canonical(a.email), event.email.as_deref());

        if let Some(business) = &event.business {
            let group = canonical(a.business);
            open(&mut out, group);
            leaf(&mut out, canonical(a.business_name), business.business_name.as_deref());
            leaf(&mut out, canonical(a.business_email), business.business_email.as_deref());
            leaf(&mut out, canonical(a.real_address), business.real_address.as_deref());
            leaf(&mut out, canonical(a.vat_number), business.vat_number.as_deref());
            leaf(&mut out, canonical(a.billing_address), business.billing_address.as_deref());
            close(&mut out, group);
        }

        close(&mut out, root);
        out
    }

    /// Decode an event from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedEvent`] if the payload is not UTF-8 or
    /// [`decode`](Self::decode) fails.
    pub fn decode_bytes(&self, payload: &[u8]) -> Result<UserLifecycleEvent, CodecError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CodecError::MalformedEvent(format!("payload is not UTF-8: {e}")))?;
        self.decode(text)
    }

    /// Decode an event from an XML document.
    ///
    /// # Errors
    ///
    /// - [`CodecError::MalformedEvent`] if the XML is not well-formed, the root is not
    ///   a known envelope, or no action element is present.
    /// - [`CodecError::UnknownAction`] if the action is not CREATE/UPDATE/DELETE.
    pub fn decode(&self, xml: &str) -> Result<UserLifecycleEvent, CodecError> {
        let a = &self.aliases;
        let root = parse_tree(xml)?;

        if !a.envelope.contains(&root.name.as_str()) {
            return Err(CodecError::MalformedEvent(format!(
                "unexpected root element `{}`, expected one of {:?}",
                root.name, a.envelope
            )));
        }

        let raw_action = root.text_of(a.action).ok_or_else(|| {
            CodecError::MalformedEvent(format!("missing action element {:?}", a.action))
        })?;
        let action: Action = raw_action
            .parse()
            .map_err(|_| CodecError::UnknownAction(raw_action.clone()))?;

        let business = root.child(a.business).map(|group| BusinessInfo {
            business_name: group.text_of(a.business_name),
            business_email: group.text_of(a.business_email),
            real_address: group.text_of(a.real_address),
            vat_number: group.text_of(a.vat_number),
            billing_address: group.text_of(a.billing_address),
        });

        Ok(UserLifecycleEvent {
            action,
            user_id: root.text_of(a.user_id).unwrap_or_default(),
            action_time: root.text_of(a.action_time).unwrap_or_default(),
            credential: root.text_of(a.credential),
            first_name: root.text_of(a.first_name),
            last_name: root.text_of(a.last_name),
            phone_number: root.text_of(a.phone_number),
            email: root.text_of(a.email),
            business,
        })
    }
}

fn canonical(aliases: &'static [&'static str]) -> &'static str {
    aliases.first().copied().unwrap_or_default()
}

fn open(out: &mut String, name: &str) {
    let _ = write!(out, "<{name}>");
}

fn close(out: &mut String, name: &str) {
    let _ = write!(out, "</{name}>");
}

fn leaf(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        let _ = write!(out, "<{name}>{}</{name}>", escape(value));
    }
}

/// Minimal element tree; attributes are not part of the wire format.
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, aliases: &[&str]) -> Option<&Self> {
        aliases
            .iter()
            .find_map(|alias| self.children.iter().find(|c| c.name == *alias))
    }

    fn text_of(&self, aliases: &[&str]) -> Option<String> {
        self.child(aliases).map(|c| c.text.clone())
    }
}

fn parse_tree(xml: &str) -> Result<Element, CodecError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            CodecError::MalformedEvent(format!(
                "XML parse error at position {}: {e}",
                reader.buffer_position()
            ))
        })?;

        match event {
            XmlEvent::Start(start) => {
                stack.push(Element {
                    name: element_name(start.local_name().as_ref())?,
                    ..Element::default()
                });
            },
            XmlEvent::Empty(start) => {
                let element = Element {
                    name: element_name(start.local_name().as_ref())?,
                    ..Element::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            },
            XmlEvent::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| CodecError::MalformedEvent(format!("bad text: {e}")))?;
                    current.text.push_str(&text);
                }
            },
            XmlEvent::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| CodecError::MalformedEvent(format!("bad CDATA: {e}")))?;
                    current.text.push_str(text);
                }
            },
            XmlEvent::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(CodecError::MalformedEvent("unbalanced end tag".to_string()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            },
            XmlEvent::Eof => {
                return Err(CodecError::MalformedEvent(if stack.is_empty() {
                    "document has no envelope element".to_string()
                } else {
                    "document ended before the envelope was closed".to_string()
                }));
            },
            _ => {}
        }
    }
}

fn element_name(raw: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| CodecError::MalformedEvent(format!("bad element name: {e}")))
}
