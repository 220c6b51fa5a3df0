//! Explicit model of the floating text-style panel.
//!
//! The panel follows exactly one text object while it is being edited. The
//! canvas reports `enter`/`exit` transitions; style changes only reach an
//! object while the machine is in [`TextEditState::Editing`].

use tracing::debug;

/// Canvas-assigned identity of a text object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    Select,
    Text,
    Draw,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEditState {
    #[default]
    Idle,
    Editing(TextObjectId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextStyleChange {
    FontSize(f32),
    FontFamily(String),
    Color(String),
    Bold(bool),
}

/// What the canvas should do with the object that just left editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Keep(TextObjectId),
    RemoveEmpty(TextObjectId),
    /// The exit came from focus moving into the style toolbar; editing goes on.
    Ignored,
    /// Nothing was being edited.
    None,
}

#[derive(Debug, Default)]
pub struct TextEditMachine {
    state: TextEditState,
    tool: Tool,
    toolbar_interacting: bool,
}

impl TextEditMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TextEditState {
        self.state
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn set_tool(&mut self, tool: Tool) {
        self.tool = tool;
    }

    pub fn is_editing(&self) -> bool {
        matches!(self.state, TextEditState::Editing(_))
    }

    pub fn enter(&mut self, object: TextObjectId) {
        debug!(object = object.0, "text editing entered");
        self.state = TextEditState::Editing(object);
    }

    pub fn exit(&mut self, text_is_blank: bool) -> ExitAction {
        if self.toolbar_interacting {
            return ExitAction::Ignored;
        }
        let TextEditState::Editing(object) = self.state else {
            return ExitAction::None;
        };
        self.state = TextEditState::Idle;
        if self.tool == Tool::Text {
            self.tool = Tool::Select;
        }
        debug!(object = object.0, text_is_blank, "text editing exited");
        if text_is_blank {
            ExitAction::RemoveEmpty(object)
        } else {
            ExitAction::Keep(object)
        }
    }

    /// Leaves editing regardless of toolbar focus, e.g. before the session
    /// this canvas belongs to is swapped out.
    pub fn force_exit(&mut self) -> Option<TextObjectId> {
        self.toolbar_interacting = false;
        match std::mem::take(&mut self.state) {
            TextEditState::Editing(object) => {
                if self.tool == Tool::Text {
                    self.tool = Tool::Select;
                }
                Some(object)
            }
            TextEditState::Idle => None,
        }
    }

    /// Routes a toolbar change to the edited object; `None` while idle.
    pub fn restyle(&self, change: TextStyleChange) -> Option<(TextObjectId, TextStyleChange)> {
        match self.state {
            TextEditState::Editing(object) => Some((object, change)),
            TextEditState::Idle => None,
        }
    }

    pub fn begin_toolbar_interaction(&mut self) {
        self.toolbar_interacting = true;
    }

    pub fn end_toolbar_interaction(&mut self) {
        self.toolbar_interacting = false;
    }
}
