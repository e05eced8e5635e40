use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};

use crate::twilio::client::TwilioClient;

/// Fixed registry of actions the assistant may request.
///
/// Every invocation returns a structured JSON value, including failures:
/// unknown tools and downstream errors become `{"error": ...}` or
/// `{"success": false, ...}` results that flow back into the conversation,
/// never panics or handler errors.
pub struct ToolRegistry {
    twilio: Arc<TwilioClient>,
}

impl ToolRegistry {
    pub fn new(twilio: Arc<TwilioClient>) -> Self {
        Self { twilio }
    }

    /// Tool schemas offered to the model, in chat-completions function format.
    pub fn catalog() -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "function": {
                    "name": "check_availability",
                    "description": "Check available appointment slots for a given date",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "date": { "type": "string", "description": "Date (YYYY-MM-DD)" }
                        },
                        "required": ["date"]
                    }
                }
            }),
            json!({
                "type": "function",
                "function": {
                    "name": "book_appointment",
                    "description": "Book an appointment for a customer",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "date": { "type": "string", "description": "Date (YYYY-MM-DD)" },
                            "time": { "type": "string", "description": "Time (HH:MM 24hr)" },
                            "customerName": { "type": "string", "description": "Customer name" },
                            "phone": { "type": "string", "description": "Phone number" },
                            "service": { "type": "string", "description": "Service type" }
                        },
                        "required": ["date", "time", "customerName", "phone"]
                    }
                }
            }),
            json!({
                "type": "function",
                "function": {
                    "name": "send_confirmation_sms",
                    "description": "Send appointment confirmation via SMS",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "phone": { "type": "string", "description": "Customer phone" },
                            "message": { "type": "string", "description": "Confirmation message" }
                        },
                        "required": ["phone", "message"]
                    }
                }
            }),
        ]
    }

    /// Dispatch one tool call by name.
    pub async fn invoke(&self, name: &str, args: &Value) -> Value {
        tracing::info!(tool = name, %args, "Executing tool");

        match name {
            "check_availability" => check_availability(args),
            "book_appointment" => book_appointment(args),
            "send_confirmation_sms" => self.send_confirmation_sms(args).await,
            _ => json!({ "error": format!("Unknown tool: {name}") }),
        }
    }

    async fn send_confirmation_sms(&self, args: &Value) -> Value {
        let Some(phone) = args["phone"].as_str() else {
            return json!({ "success": false, "error": "missing required argument: phone" });
        };
        let Some(message) = args["message"].as_str() else {
            return json!({ "success": false, "error": "missing required argument: message" });
        };

        // No retry on failure; the model decides how to react
        match self.twilio.send_sms(phone, message).await {
            Ok(sid) => json!({
                "success": true,
                "messageSid": sid,
                "message": "Confirmation SMS sent successfully"
            }),
            Err(e) => {
                tracing::error!("SMS error: {e}");
                json!({ "success": false, "error": e.to_string() })
            }
        }
    }
}

/// Mock slot lookup. Stands in for a real scheduling system.
fn check_availability(args: &Value) -> Value {
    let date = args["date"].as_str().unwrap_or("the requested date");
    let slots = ["9:00 AM", "11:00 AM", "2:00 PM", "4:00 PM"];
    json!({
        "date": date,
        "available": true,
        "slots": slots,
        "message": format!("Available slots for {date}: {}", slots.join(", "))
    })
}

/// Mock booking. Synthesizes a unique appointment id per call.
fn book_appointment(args: &Value) -> Value {
    let date = args["date"].as_str().unwrap_or_default();
    let time = args["time"].as_str().unwrap_or_default();
    let customer_name = args["customerName"].as_str().unwrap_or("the customer");
    let appointment_id = new_appointment_id();

    tracing::info!(appointment_id = %appointment_id, date, time, "Booking appointment");

    json!({
        "success": true,
        "appointmentId": appointment_id,
        "date": date,
        "time": time,
        "message": format!(
            "Appointment booked! ID: {appointment_id} for {customer_name} on {date} at {time}"
        )
    })
}

fn new_appointment_id() -> String {
    format!(
        "APT-{}-{:04}",
        Utc::now().timestamp_millis(),
        rand::thread_rng().gen_range(0..10_000)
    )
}
