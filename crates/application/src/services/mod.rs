mod call_service;
mod chat_service;
mod conversation_service;

pub use call_service::{CallService, CallServiceDependencies};
pub use chat_service::{
    ChatService, ChatServiceDependencies, HistoryLimits, MessagePage, MessageSearchPage,
    SearchMessagesRequest,
};
pub use conversation_service::{
    ConversationService, ConversationServiceDependencies, ConversationView,
    ReportMessageRequest, StartConversationRequest, StartedConversation,
};
