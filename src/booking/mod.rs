pub mod extract;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use self::extract::FieldExtractor;

static RE_BOOKING_INTENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(book|appointment|schedule)\b").unwrap());

/// Coarse conversation phase used to steer prompt augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Greeting,
    CollectingInfo,
    Confirming,
    Booking,
    Complete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::CollectingInfo => "collecting_info",
            Stage::Confirming => "confirming",
            Stage::Booking => "booking",
            Stage::Complete => "complete",
        }
    }

    /// Legal stage edges. Monotonic toward Complete, except the single
    /// regression Confirming -> CollectingInfo when details reopen.
    pub fn can_transition(self, to: Stage) -> bool {
        matches!(
            (self, to),
            (Stage::Greeting, Stage::CollectingInfo)
                | (Stage::CollectingInfo, Stage::Confirming)
                | (Stage::Confirming, Stage::CollectingInfo)
                | (Stage::Confirming, Stage::Booking)
                | (Stage::Booking, Stage::Complete)
        )
    }
}

/// Appointment details collected so far. Field names match the
/// `book_appointment` tool schema.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Tracks where the booking conversation is and what is still missing.
#[derive(Debug, Clone)]
pub struct BookingState {
    pub stage: Stage,
    pub fields: AppointmentFields,
    pub attempt_count: u32,
}

impl Default for BookingState {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingState {
    pub fn new() -> Self {
        Self {
            stage: Stage::Greeting,
            fields: AppointmentFields::default(),
            attempt_count: 0,
        }
    }

    /// Required fields not collected yet, in tool-schema names.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.fields.date.is_none() {
            missing.push("date");
        }
        if self.fields.time.is_none() {
            missing.push("time");
        }
        if self.fields.customer_name.is_none() {
            missing.push("customerName");
        }
        if self.fields.phone.is_none() {
            missing.push("phone");
        }
        missing
    }

    /// Apply a legal stage transition. Illegal edges are refused and logged,
    /// never applied.
    pub fn advance(&mut self, to: Stage) -> bool {
        if self.stage == to {
            return true;
        }
        if self.stage.can_transition(to) {
            tracing::debug!(from = self.stage.as_str(), to = to.as_str(), "Stage advanced");
            self.stage = to;
            true
        } else {
            tracing::warn!(
                from = self.stage.as_str(),
                to = to.as_str(),
                "Refused illegal stage transition"
            );
            false
        }
    }

    /// Update state from one caller utterance: extract fields, detect
    /// booking intent, and move the stage along.
    pub fn observe_utterance(&mut self, text: &str, extractor: &dyn FieldExtractor) {
        let found = extractor.extract(text);
        if found.date.is_some() {
            self.fields.date = found.date;
        }
        if found.time.is_some() {
            self.fields.time = found.time;
        }
        if found.phone.is_some() {
            self.fields.phone = found.phone;
        }

        match self.stage {
            Stage::Greeting => {
                if RE_BOOKING_INTENT.is_match(text) {
                    self.advance(Stage::CollectingInfo);
                }
            }
            Stage::CollectingInfo => {
                self.attempt_count += 1;
                if self.missing_fields().is_empty() {
                    self.advance(Stage::Confirming);
                }
            }
            Stage::Confirming => {
                if !self.missing_fields().is_empty() {
                    // Details reopened, go back to collecting
                    self.advance(Stage::CollectingInfo);
                }
            }
            Stage::Booking | Stage::Complete => {}
        }
    }

    /// Merge field values the model supplied as `book_appointment` arguments.
    /// The model often has details (like the caller's name) that the regex
    /// extractor never sees.
    pub fn merge_tool_args(&mut self, args: &serde_json::Value) {
        let mut set = |slot: &mut Option<String>, key: &str| {
            if let Some(v) = args.get(key).and_then(|v| v.as_str()) {
                *slot = Some(v.to_string());
            }
        };
        set(&mut self.fields.date, "date");
        set(&mut self.fields.time, "time");
        set(&mut self.fields.customer_name, "customerName");
        set(&mut self.fields.phone, "phone");
        set(&mut self.fields.service, "service");
    }

    pub fn begin_booking(&mut self) {
        self.advance(Stage::Booking);
    }

    pub fn complete_booking(&mut self) {
        self.advance(Stage::Complete);
    }

    /// Synthetic system turn injected before each completion call so the
    /// model knows the stage, what is collected, and what to ask for next.
    pub fn state_context(&self) -> String {
        let collected =
            serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string());
        match self.stage {
            Stage::Greeting => "CURRENT STATE: Greeting/Initial Contact\n\
                 - You just answered the call\n\
                 - Ask how you can help today\n\
                 - Listen for booking requests or questions"
                .to_string(),
            Stage::CollectingInfo => {
                let missing = self.missing_fields();
                let still_need = if missing.is_empty() {
                    "nothing - ready to confirm!".to_string()
                } else {
                    missing.join(", ")
                };
                format!(
                    "CURRENT STATE: Collecting Appointment Information\n\
                     - You're gathering: date, time, name, phone, service type\n\
                     - Current data collected: {collected}\n\
                     - Still need: {still_need}\n\
                     - Ask for ONE missing field at a time (don't overwhelm caller)\n\
                     - Attempt #{} - if > 2, offer to have someone call them back",
                    self.attempt_count
                )
            }
            Stage::Confirming => format!(
                "CURRENT STATE: Confirming Details\n\
                 - You have all information needed\n\
                 - Data to confirm: {collected}\n\
                 - Read back ALL details clearly\n\
                 - Ask \"Does that sound correct?\" or \"Should I book this for you?\"\n\
                 - If confirmed, proceed to booking\n\
                 - If changes needed, go back to collecting"
            ),
            Stage::Booking => "CURRENT STATE: Booking in Progress\n\
                 - You're actively booking the appointment\n\
                 - Use the book_appointment tool\n\
                 - Don't ask more questions, just confirm booking"
                .to_string(),
            Stage::Complete => "CURRENT STATE: Booking Complete\n\
                 - Appointment is booked\n\
                 - Confirm appointment details one final time\n\
                 - Ask if there's anything else you can help with\n\
                 - If no, end gracefully"
                .to_string(),
        }
    }
}
