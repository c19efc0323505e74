fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("shadow_rs build info generation failed");
}
