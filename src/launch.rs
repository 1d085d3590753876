use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::error::{CallError, CallResult};
use crate::internal::data_types::{CallId, CallType, ConversationId};

const HASH_ROUTE: &str = "#/call";

/// what a freshly opened call window needs to know. encoded as query parameters on the
/// web and as a hash route in the desktop shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallWindowParams {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub is_incoming: bool,
    pub call_type: Option<CallType>,
    pub sfu_room_name: Option<String>,
}

impl CallWindowParams {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("callId", self.call_id.to_string()),
            ("conversationId", self.conversation_id.clone()),
            ("isIncoming", self.is_incoming.to_string()),
        ];
        if let Some(call_type) = self.call_type {
            pairs.push(("callType", call_type.to_string()));
        }
        if let Some(room) = &self.sfu_room_name {
            pairs.push(("sfuRoomName", room.clone()));
        }
        pairs
    }

    fn from_pairs<'a, I>(pairs: I) -> CallResult<Self>
    where
        I: Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
    {
        let mut call_id = None;
        let mut conversation_id = None;
        let mut is_incoming = None;
        let mut call_type = None;
        let mut sfu_room_name = None;

        for (key, value) in pairs {
            match key.as_ref() {
                "callId" => call_id = Some(CallId::from(value.into_owned())),
                "conversationId" => conversation_id = Some(value.into_owned()),
                "isIncoming" => {
                    let parsed = value.parse::<bool>().map_err(|_| {
                        CallError::InvalidLocation(format!("isIncoming={}", value))
                    })?;
                    is_incoming = Some(parsed);
                }
                "callType" => {
                    let parsed = value
                        .parse::<CallType>()
                        .map_err(|e| CallError::InvalidLocation(e.to_string()))?;
                    call_type = Some(parsed);
                }
                "sfuRoomName" => sfu_room_name = Some(value.into_owned()),
                other => log::debug!("ignoring unknown call window parameter {}", other),
            }
        }

        let missing = |name: &str| CallError::InvalidLocation(format!("missing {}", name));
        Ok(Self {
            call_id: call_id.ok_or_else(|| missing("callId"))?,
            conversation_id: conversation_id.ok_or_else(|| missing("conversationId"))?,
            is_incoming: is_incoming.ok_or_else(|| missing("isIncoming"))?,
            call_type,
            sfu_room_name,
        })
    }

    /// replaces any query already on `base`
    pub fn to_web_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_query(None);
        url.query_pairs_mut().extend_pairs(self.pairs());
        url
    }

    pub fn from_web_url(url: &Url) -> CallResult<Self> {
        Self::from_pairs(url.query_pairs())
    }

    pub fn to_hash_route(&self) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs())
            .finish();
        format!("{}?{}", HASH_ROUTE, query)
    }

    /// accepts the bare route or a full location that ends with it
    pub fn from_hash_route(location: &str) -> CallResult<Self> {
        let route = match location.find('#') {
            Some(i) => &location[i..],
            None => location,
        };
        let query = route
            .strip_prefix(HASH_ROUTE)
            .ok_or_else(|| CallError::InvalidLocation(format!("not a call route: {}", route)))?;
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_pairs(form_urlencoded::parse(query.as_bytes()))
    }
}
