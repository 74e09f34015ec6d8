use frontdesk_core::domain::business::BusinessContext;
use frontdesk_core::domain::conversation::{Entities, Intent};
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

/// Used whenever a turn cannot be processed; never rendered through a template.
pub const TECHNICAL_ERROR_REPLY: &str =
    "I'm sorry, I'm having trouble right now. Let me connect you with someone who can help.";

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply template error: {0}")]
    Template(String),
}

impl From<tera::Error> for ReplyError {
    fn from(error: tera::Error) -> Self {
        Self::Template(error.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    Welcome,
    Greeting,
    Booking,
    ServiceInquiry,
    PricingInquiry,
    Emergency,
    HumanRequest,
    Complaint,
    Goodbye,
    InformationRequest,
    Clarification,
}

impl ReplyKind {
    pub fn template_name(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome.txt.tera",
            Self::Greeting => "greeting.txt.tera",
            Self::Booking => "booking.txt.tera",
            Self::ServiceInquiry => "service_inquiry.txt.tera",
            Self::PricingInquiry => "pricing_inquiry.txt.tera",
            Self::Emergency => "emergency.txt.tera",
            Self::HumanRequest => "human_request.txt.tera",
            Self::Complaint => "complaint.txt.tera",
            Self::Goodbye => "goodbye.txt.tera",
            Self::InformationRequest => "information_request.txt.tera",
            Self::Clarification => "clarification.txt.tera",
        }
    }

    pub fn for_intent(intent: Intent) -> Self {
        match intent {
            Intent::Greeting => Self::Greeting,
            Intent::AppointmentBooking => Self::Booking,
            Intent::ServiceInquiry => Self::ServiceInquiry,
            Intent::PricingInquiry => Self::PricingInquiry,
            Intent::Emergency => Self::Emergency,
            Intent::HumanRequest => Self::HumanRequest,
            Intent::Complaint => Self::Complaint,
            Intent::Goodbye => Self::Goodbye,
            Intent::InformationRequest => Self::InformationRequest,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PricedService {
    pub name: String,
    pub price: String,
}

/// Values a reply template may reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplyContext {
    pub business_name: String,
    pub hours: String,
    pub services: Vec<String>,
    pub priced_services: Vec<PricedService>,
    pub available_slots: Vec<String>,
    pub customer_name: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub agent_name: Option<String>,
    pub greeting: Option<String>,
}

impl ReplyContext {
    pub fn from_business(business: &BusinessContext, entities: &Entities) -> Self {
        Self {
            business_name: business.profile.name.clone(),
            hours: business.profile.hours.clone(),
            services: business.service_names(),
            priced_services: business
                .profile
                .services
                .iter()
                .filter_map(|service| {
                    service.base_price.map(|price| PricedService {
                        name: service.name.clone(),
                        price: price.round_dp(2).to_string(),
                    })
                })
                .collect(),
            available_slots: business.next_slots(3),
            customer_name: entities.get("name").cloned(),
            date: entities.get("date").cloned(),
            time: entities.get("time").cloned(),
            agent_name: None,
            greeting: None,
        }
    }
}

pub struct ReplyRenderer {
    tera: Tera,
}

impl ReplyRenderer {
    pub fn new() -> Result<Self, ReplyError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("welcome.txt.tera", include_str!("../templates/replies/welcome.txt.tera")),
            ("greeting.txt.tera", include_str!("../templates/replies/greeting.txt.tera")),
            ("booking.txt.tera", include_str!("../templates/replies/booking.txt.tera")),
            (
                "service_inquiry.txt.tera",
                include_str!("../templates/replies/service_inquiry.txt.tera"),
            ),
            (
                "pricing_inquiry.txt.tera",
                include_str!("../templates/replies/pricing_inquiry.txt.tera"),
            ),
            ("emergency.txt.tera", include_str!("../templates/replies/emergency.txt.tera")),
            ("human_request.txt.tera", include_str!("../templates/replies/human_request.txt.tera")),
            ("complaint.txt.tera", include_str!("../templates/replies/complaint.txt.tera")),
            ("goodbye.txt.tera", include_str!("../templates/replies/goodbye.txt.tera")),
            (
                "information_request.txt.tera",
                include_str!("../templates/replies/information_request.txt.tera"),
            ),
            ("clarification.txt.tera", include_str!("../templates/replies/clarification.txt.tera")),
        ])?;
        Ok(Self { tera })
    }

    pub fn render(&self, kind: ReplyKind, context: &ReplyContext) -> Result<String, ReplyError> {
        let context = Context::from_serialize(context)?;
        let rendered = self.tera.render(kind.template_name(), &context)?;
        Ok(rendered.trim().to_string())
    }
}
