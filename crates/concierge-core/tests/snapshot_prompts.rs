use concierge_core::prompt::{PromptTemplate, TemplateBindings};
use concierge_core::quiz::{QuizConfig, QuizState};
use concierge_core::quiz::engine::render_summary;
use concierge_core::users::{Profile, ProfileValue};
use insta::assert_snapshot;

fn profile() -> Profile {
    let mut profile = Profile::new();
    profile.insert("owner_name".into(), ProfileValue::Text("Marta".into()));
    profile.insert("business".into(), ProfileValue::Text("Ceramics studio".into()));
    profile.insert(
        "services".into(),
        ProfileValue::List(vec!["Delivery".into(), "Custom orders".into()]),
    );
    profile
}

#[test]
fn test_assistant_prompt_snapshot() {
    let template = PromptTemplate::new(
        "You answer clients of {{owner_name}} on {{date}}.\n\
         The client is {{ client_name }}.\n\
         {{unknown}}Business profile:\n{{profile}}",
    );
    let bindings = TemplateBindings::new()
        .bind("owner_name", "Marta")
        .bind("client_name", "Ana")
        .bind("date", "2025-03-01");
    assert_snapshot!(template.render(&bindings, &profile()), @r"
    You answer clients of Marta on 2025-03-01.
    The client is Ana.
    Business profile:
    business: Ceramics studio
    owner_name: Marta
    services: Delivery, Custom orders
    ");
}

#[test]
fn test_builtin_summary_lists_every_answer() {
    let config = QuizConfig::builtin().expect("builtin questionnaire");
    let mut state = QuizState::default();
    state
        .answers
        .insert("name".into(), ProfileValue::Text("Marta".into()));
    let summary = render_summary(&config, &state);
    assert!(summary.starts_with("Thank you! Here is what you told me:"));
    assert!(summary.contains("Marta"));
}
