use std::sync::Arc;

use application::{
    AdDirectory, CallRepository, CallService, CallServiceDependencies, ChatGateway,
    ChatGatewayDependencies, ChatService, ChatServiceDependencies, Clock, ConversationRepository,
    ConversationService, ConversationServiceDependencies, HistoryLimits, MessageRepository,
    PresenceTracker, RateLimiter, RateLimits, RoomManager, SessionAuthenticator, TokenVerifier,
    UserRepository,
};
use config::ChatConfig;

/// 组装应用状态所需的外部依赖
pub struct StateDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub calls: Arc<dyn CallRepository>,
    pub users: Arc<dyn UserRepository>,
    pub ads: Arc<dyn AdDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub clock: Arc<dyn Clock>,
    pub chat: ChatConfig,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    pub authenticator: Arc<SessionAuthenticator>,
    pub chat_service: Arc<ChatService>,
    pub call_service: Arc<CallService>,
    pub conversation_service: Arc<ConversationService>,
    pub limits: Arc<RateLimits>,
}

impl AppState {
    pub fn new(deps: StateDependencies) -> Self {
        let rooms = Arc::new(RoomManager::new());
        let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
            conversations: deps.conversations.clone(),
            messages: deps.messages.clone(),
            rooms: rooms.clone(),
            clock: deps.clock.clone(),
            history: HistoryLimits {
                default_limit: deps.chat.history_default_limit,
                max_limit: deps.chat.history_max_limit,
            },
        }));
        let call_service = Arc::new(CallService::new(CallServiceDependencies {
            calls: deps.calls,
            chat: chat_service.clone(),
            rooms: rooms.clone(),
            clock: deps.clock.clone(),
        }));
        let conversation_service =
            Arc::new(ConversationService::new(ConversationServiceDependencies {
                conversations: deps.conversations,
                messages: deps.messages,
                ads: deps.ads,
                chat: chat_service.clone(),
                clock: deps.clock.clone(),
            }));

        let limits = Arc::new(RateLimits {
            messages: Arc::new(RateLimiter::messages(
                deps.chat.messages_per_window,
                deps.chat.message_window(),
                deps.clock.clone(),
            )),
            typing: Arc::new(RateLimiter::typing(
                deps.chat.typing_per_window,
                deps.chat.typing_window(),
                deps.clock.clone(),
            )),
        });
        let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
            rooms,
            presence: Arc::new(PresenceTracker::new(deps.clock)),
            chat: chat_service.clone(),
            calls: call_service.clone(),
            limits: limits.clone(),
        }));

        Self {
            gateway,
            authenticator: Arc::new(SessionAuthenticator::new(deps.verifier, deps.users)),
            chat_service,
            call_service,
            conversation_service,
            limits,
        }
    }
}
