use crate::DomainResult;
use crate::conversations::{
    Conversation, ConversationParticipant, ConversationSummary, Message, MessageAppend,
    MessageCatchup,
};
use crate::ports::BoxFuture;

#[allow(clippy::needless_pass_by_value)]
pub trait ConversationRepository: Send + Sync {
    /// Creates the conversation and its participant rows together. A second
    /// direct conversation for the same pair fails with `Conflict`.
    fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[ConversationParticipant],
    ) -> BoxFuture<'_, DomainResult<Conversation>>;

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>>;

    fn find_direct(&self, direct_key: &str) -> BoxFuture<'_, DomainResult<Option<Conversation>>>;

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>>;

    /// Every participant row, including those who left.
    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ConversationParticipant>>>;

    fn list_for_user(&self, user_id: &str)
    -> BoxFuture<'_, DomainResult<Vec<ConversationSummary>>>;

    fn update_participant(
        &self,
        participant: &ConversationParticipant,
    ) -> BoxFuture<'_, DomainResult<ConversationParticipant>>;

    /// Stores the message, moves the last-message pointer and bumps unread and
    /// mention counters of the other active participants, atomically. A replay
    /// of the same `(conversation_id, request_id)` returns the stored message.
    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<MessageAppend>>;

    fn list_messages(
        &self,
        conversation_id: &str,
        cursor: &MessageCatchup,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>>;

    /// Clears unread and mention counters and stamps `last_read_at_ms`.
    fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>>;
}
