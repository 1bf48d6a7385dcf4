//! Prompt text sent to the model. The JSON key names are part of the reply
//! contract parsed in `client`, so keep them in sync.

use crate::client::{EssayItem, QuestionRequest, QuestionType};

const OBJECTIVE_RULES: &str = "\
• Cada questão objetiva deve conter exatamente 4 alternativas.
• NÃO inclua letras, números ou quaisquer rótulos (ex.: \"A)\", \"B)\", \"1.\") antes do texto das alternativas.
• Apenas UMA alternativa deve ter \"correta\": true.";

const QUESTION_OUTPUT_FORMAT: &str = r#"Formato de saída:
• Retorne APENAS um objeto JSON válido, sem explicações antes ou depois.
• Utilize exatamente a estrutura abaixo, mantendo nomes de chaves em português e em minúsculas.
• Certifique-se de que o JSON esteja bem-formado (sem vírgulas pendentes, aspas incorretas, etc.).

Estrutura esperada:
{
  "questoes": [
    {
      "texto": "Texto da questão",
      "tipo": "objetiva|discursiva",
      "alternativas": [
        { "texto": "Texto da alternativa 1", "correta": true },
        { "texto": "Texto da alternativa 2", "correta": false },
        { "texto": "Texto da alternativa 3", "correta": false },
        { "texto": "Texto da alternativa 4", "correta": false }
      ],
      "respostaCorreta": "Resposta esperada (apenas para discursivas)"
    }
  ]
}

Observações:
• Para questões discursivas, deixe "alternativas": [] e preencha "respostaCorreta".
• Não inclua rótulos (A, B, C, D, 1, 2, 3, 4) nos textos das alternativas.

IMPORTANTE: Responda SOMENTE com o JSON final, nada mais."#;

const GRADING_HEADER: &str = r#"Você é um corretor de provas. Avalie cada questão discursiva atribuindo uma nota de 0 a 10, onde 0 significa totalmente incorreto e 10 totalmente correto. Considere parcialmente correto se a resposta contiver elementos corretos. Responda SOMENTE com um objeto JSON no formato do exemplo.

Exemplo de formato de resposta:
{
  "resultados": [
    { "id": "q1", "nota": 8, "comentario": "Resposta boa, mas faltou citar X." },
    { "id": "q2", "nota": 10 }
  ]
}

Questões a corrigir:
"#;

pub fn question_prompt(request: &QuestionRequest) -> String {
    let mut prompt = String::from(
        "Você é uma IA especialista na elaboração de avaliações escolares.\n\nObjetivo:\n",
    );
    prompt.push_str(&format!(
        "Crie exatamente {} questões de {} sobre {} no nível de dificuldade {}.\n",
        request.count,
        request.subject.trim(),
        request.topic.trim(),
        request.difficulty.label()
    ));

    prompt.push_str("\nRegras de composição:\n");
    match request.question_type {
        QuestionType::Objetiva => {
            prompt.push_str("• Todas as questões DEVEM ser objetivas.\n");
            prompt.push_str(OBJECTIVE_RULES);
            prompt.push('\n');
        }
        QuestionType::Discursiva => {
            prompt.push_str("• Todas as questões DEVEM ser discursivas.\n");
        }
        QuestionType::Mista => {
            prompt.push_str(
                "• Produza uma mistura equilibrada entre questões objetivas e discursivas.\n",
            );
            prompt.push_str(OBJECTIVE_RULES);
            prompt.push('\n');
        }
    }
    if let Some(extra) = request
        .extra_instructions
        .as_deref()
        .filter(|extra| !extra.trim().is_empty())
    {
        prompt.push_str(&format!("• Instruções adicionais do professor: {extra}\n"));
    }

    prompt.push('\n');
    prompt.push_str(QUESTION_OUTPUT_FORMAT);
    prompt
}

pub fn grading_prompt(items: &[EssayItem]) -> String {
    let mut prompt = String::from(GRADING_HEADER);
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            prompt.push_str("---\n");
        }
        prompt.push_str(&format!(
            "ID: {}\nEnunciado: {}\nGabarito: {}\nResposta do aluno: {}\n",
            item.id, item.prompt, item.reference_answer, item.student_answer
        ));
    }
    prompt
}
