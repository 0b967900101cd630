use serde::{Deserialize, Serialize};

/// The closed set of request types the gateway knows how to route.
///
/// This is used only for routing and for the two special response
/// handlers (`get-sheet-response`, `download-file-result`); the base
/// `t -> t-result` path is fully generic and does not otherwise inspect
/// the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    Search,
    Entity,
    Structure,
    Contents,
    Create,
    Update,
    Delete,
    Rolls,
    LastRoll,
    Roll,
    GetSheet,
    MacroExecute,
    Macros,
    Encounters,
    StartEncounter,
    NextTurn,
    NextRound,
    LastTurn,
    LastRound,
    EndEncounter,
    AddToEncounter,
    RemoveFromEncounter,
    Kill,
    Decrease,
    Increase,
    Give,
    Remove,
    ExecuteJs,
    Select,
    Selected,
    FileSystem,
    UploadFile,
    DownloadFile,
    GetActorDetails,
    ModifyItemCharges,
    UseAbility,
    UseFeature,
    UseSpell,
    UseItem,
    ModifyExperience,
    AddItem,
    RemoveItem,
    GetFolder,
    CreateFolder,
    DeleteFolder,
    ChatMessages,
    Chat,
}

impl RequestType {
    /// The wire name of this request type (the `type` field sent to peers).
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Search => "search",
            RequestType::Entity => "entity",
            RequestType::Structure => "structure",
            RequestType::Contents => "contents",
            RequestType::Create => "create",
            RequestType::Update => "update",
            RequestType::Delete => "delete",
            RequestType::Rolls => "rolls",
            RequestType::LastRoll => "last-roll",
            RequestType::Roll => "roll",
            RequestType::GetSheet => "get-sheet",
            RequestType::MacroExecute => "macro-execute",
            RequestType::Macros => "macros",
            RequestType::Encounters => "encounters",
            RequestType::StartEncounter => "start-encounter",
            RequestType::NextTurn => "next-turn",
            RequestType::NextRound => "next-round",
            RequestType::LastTurn => "last-turn",
            RequestType::LastRound => "last-round",
            RequestType::EndEncounter => "end-encounter",
            RequestType::AddToEncounter => "add-to-encounter",
            RequestType::RemoveFromEncounter => "remove-from-encounter",
            RequestType::Kill => "kill",
            RequestType::Decrease => "decrease",
            RequestType::Increase => "increase",
            RequestType::Give => "give",
            RequestType::Remove => "remove",
            RequestType::ExecuteJs => "execute-js",
            RequestType::Select => "select",
            RequestType::Selected => "selected",
            RequestType::FileSystem => "file-system",
            RequestType::UploadFile => "upload-file",
            RequestType::DownloadFile => "download-file",
            RequestType::GetActorDetails => "get-actor-details",
            RequestType::ModifyItemCharges => "modify-item-charges",
            RequestType::UseAbility => "use-ability",
            RequestType::UseFeature => "use-feature",
            RequestType::UseSpell => "use-spell",
            RequestType::UseItem => "use-item",
            RequestType::ModifyExperience => "modify-experience",
            RequestType::AddItem => "add-item",
            RequestType::RemoveItem => "remove-item",
            RequestType::GetFolder => "get-folder",
            RequestType::CreateFolder => "create-folder",
            RequestType::DeleteFolder => "delete-folder",
            RequestType::ChatMessages => "chat-messages",
            RequestType::Chat => "chat",
        }
    }

    /// Parse a request type from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    /// The response type tag a peer is expected to reply with.
    ///
    /// Every request type follows `t -> "{t}-result"` except `get-sheet`,
    /// which replies `get-sheet-response`.
    pub fn response_type(&self) -> String {
        match self {
            RequestType::GetSheet => "get-sheet-response".to_string(),
            other => format!("{}-result", other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_sheet_response_type_is_special() {
        assert_eq!(RequestType::GetSheet.response_type(), "get-sheet-response");
    }

    #[test]
    fn base_types_follow_t_result_convention() {
        assert_eq!(RequestType::Roll.response_type(), "roll-result");
        assert_eq!(RequestType::Chat.response_type(), "chat-result");
    }

    #[test]
    fn round_trips_through_wire_name() {
        for t in [RequestType::DownloadFile, RequestType::NextRound, RequestType::Chat] {
            assert_eq!(RequestType::parse(t.as_str()), Some(t));
        }
    }
}
